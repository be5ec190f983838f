//! Typed access to the SDMMC controller register block.

use bitflags::bitflags;

use super::EMmcHost;
use crate::platform::Platform;

/// Raw 32-bit access to the controller's register window.
pub trait RegisterIo {
    fn read32(&self, offset: u32) -> u32;
    fn write32(&self, offset: u32, value: u32);
}

/// Volatile MMIO access at a fixed base address.
#[derive(Debug)]
pub struct Mmio {
    base: usize,
}

impl Mmio {
    /// # Safety
    ///
    /// `base` must map the controller's register window for the lifetime of
    /// the returned value, and nothing else may drive the controller.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    pub fn base(&self) -> usize {
        self.base
    }
}

impl RegisterIo for Mmio {
    fn read32(&self, offset: u32) -> u32 {
        unsafe { core::ptr::read_volatile((self.base + offset as usize) as *const u32) }
    }

    fn write32(&self, offset: u32, value: u32) {
        unsafe { core::ptr::write_volatile((self.base + offset as usize) as *mut u32, value) }
    }
}

/// A register with a fixed offset and a 32-bit raw value.
pub trait Register: Copy + From<u32> {
    const OFFSET: u32;

    fn raw(self) -> u32;
}

/// Declares a register newtype with a getter, a `set_` builder and
/// `_SHIFT`/`_MASK` constants for every named field.
macro_rules! register {
    (
        $(#[$meta:meta])*
        $name:ident @ $offset:literal {
            $( $(#[$fmeta:meta])* $field:ident [$msb:literal : $lsb:literal] ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
        pub struct $name(pub u32);

        #[allow(dead_code)]
        impl $name {
            pub const OFFSET: u32 = $offset;

            paste::paste! {
                $(
                    pub const [<$field:upper _SHIFT>]: u32 = $lsb;
                    pub const [<$field:upper _MASK>]: u32 = u32::MAX >> (31 - ($msb - $lsb));

                    $(#[$fmeta])*
                    #[inline]
                    pub const fn $field(self) -> u32 {
                        (self.0 >> $lsb) & Self::[<$field:upper _MASK>]
                    }

                    #[inline]
                    pub const fn [<set_ $field>](self, value: u32) -> Self {
                        let mask = Self::[<$field:upper _MASK>] << $lsb;
                        Self((self.0 & !mask) | ((value << $lsb) & mask))
                    }
                )*
            }
        }

        impl From<u32> for $name {
            fn from(raw: u32) -> Self {
                Self(raw)
            }
        }

        impl Register for $name {
            const OFFSET: u32 = $offset;

            fn raw(self) -> u32 {
                self.0
            }
        }
    };
}

register! {
    /// SDMA system address.
    SystemAddress @ 0x00 {
        address[31:0],
    }
}

register! {
    BlockSizeBlockCount @ 0x04 {
        xfer_block_size[11:0],
        /// SDMA boundary; the controller pauses at every boundary crossing.
        host_dma_buffer_size[14:12],
        blocks_count[31:16],
    }
}

register! {
    Argument @ 0x08 {
        argument[31:0],
    }
}

register! {
    /// Transfer mode (low half) and command (high half).
    CmdXferMode @ 0x0C {
        dma_en[0:0],
        block_count_en[1:1],
        auto_cmd12_en[2:2],
        data_xfer_dir_sel[4:4],
        multi_block_select[5:5],
        resp_type_select[17:16],
        cmd_crc_check_en[19:19],
        cmd_index_check_en[20:20],
        data_present_select[21:21],
        command_type[23:22],
        command_index[29:24],
    }
}

register! {
    PresentState @ 0x24 {
        cmd_inhibit_cmd[0:0],
        /// Cleared once the card releases the busy line after an R1b response.
        cmd_inhibit_dat[1:1],
        dat_line_active[2:2],
        card_inserted[16:16],
        card_state_stable[17:17],
        dat_3_0_line_level[23:20],
    }
}

register! {
    PowerControlHost @ 0x28 {
        data_xfer_width[1:1],
        high_speed_en[2:2],
        dma_select[4:3],
        /// Overrides `data_xfer_width` when set.
        extended_data_transfer_width[5:5],
        sd_bus_power[8:8],
        sd_bus_voltage_select[11:9],
    }
}

register! {
    /// Clock control, timeout control and software reset share one word.
    ClockControl @ 0x2C {
        internal_clock_en[0:0],
        internal_clock_stable[1:1],
        sd_clock_en[2:2],
        sdclk_frequency_select[15:8],
        data_timeout_counter_value[19:16],
        sw_reset_for_all[24:24],
        sw_reset_for_cmd_line[25:25],
        sw_reset_for_dat_line[26:26],
    }
}

register! {
    /// Auto CMD12 error status (low half) and host control 2 (high half).
    HostControl2 @ 0x3C {
        uhs_mode_sel[18:16],
    }
}

register! {
    Capabilities @ 0x40 {
        high_speed_support[21:21],
        voltage_support_3v3[24:24],
        voltage_support_3v0[25:25],
        voltage_support_1v8[26:26],
    }
}

register! {
    CapabilitiesHigher @ 0x44 {
        sdr50[0:0],
        sdr104[1:1],
        ddr50[2:2],
    }
}

pub const INTERRUPT_STATUS: u32 = 0x30;
pub const INTERRUPT_STATUS_ENABLE: u32 = 0x34;

pub const RESPONSE_R0_R1: u32 = 0x10;
pub const RESPONSE_R2_R3: u32 = 0x14;
pub const RESPONSE_R4_R5: u32 = 0x18;
pub const RESPONSE_R6_R7: u32 = 0x1C;

bitflags! {
    /// Interrupt status / status-enable bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IntStatus: u32 {
        const CMD_COMPLETE = 1 << 0;
        const XFER_COMPLETE = 1 << 1;
        const DMA_INTERRUPT = 1 << 3;
        const CARD_INSERTION = 1 << 6;
        const CARD_REMOVAL = 1 << 7;
        const ERR_INTERRUPT = 1 << 15;
        const COMMAND_TIMEOUT_ERR = 1 << 16;
        const COMMAND_CRC_ERR = 1 << 17;
        const COMMAND_END_BIT_ERR = 1 << 18;
        const COMMAND_INDEX_ERR = 1 << 19;
        const DATA_TIMEOUT_ERR = 1 << 20;
        const DATA_CRC_ERR = 1 << 21;
        const DATA_END_BIT_ERR = 1 << 22;

        const COMMAND_ERRORS = Self::COMMAND_TIMEOUT_ERR.bits()
            | Self::COMMAND_CRC_ERR.bits()
            | Self::COMMAND_END_BIT_ERR.bits()
            | Self::COMMAND_INDEX_ERR.bits();
        const DATA_ERRORS = Self::DATA_TIMEOUT_ERR.bits()
            | Self::DATA_CRC_ERR.bits()
            | Self::DATA_END_BIT_ERR.bits();
    }
}

impl<R: RegisterIo, P: Platform> EMmcHost<R, P> {
    pub(crate) fn read<T: Register>(&self) -> T {
        T::from(self.regs.read32(T::OFFSET))
    }

    pub(crate) fn write<T: Register>(&self, value: T) {
        self.regs.write32(T::OFFSET, value.raw());
    }

    pub(crate) fn modify<T: Register>(&self, f: impl FnOnce(T) -> T) {
        let value = self.read::<T>();
        self.write(f(value));
    }

    pub(crate) fn int_status(&self) -> IntStatus {
        IntStatus::from_bits_retain(self.regs.read32(INTERRUPT_STATUS))
    }

    /// Interrupt status bits are write-one-to-clear.
    pub(crate) fn clear_int_status(&self, bits: IntStatus) {
        self.regs.write32(INTERRUPT_STATUS, bits.bits());
    }
}
