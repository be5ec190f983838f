//! Boot configuration table input: the values a boot ROM reads from fuses or
//! the boot configuration table before touching the card.

use crate::emmc::constant::{
    EMMC_OCR_DUAL_VOLTAGE, EMMC_OCR_HIGH_VOLTAGE, EMMC_OCR_LOW_VOLTAGE, EMMC_OCR_QUERY_VOLTAGE,
};

/// Data bus width. Discriminants are the EXT_CSD BUS_WIDTH encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataWidth {
    Bit1 = 0,
    Bit4 = 1,
    Bit8 = 2,
    Ddr4 = 5,
    Ddr8 = 6,
}

impl DataWidth {
    pub fn is_ddr(self) -> bool {
        matches!(self, DataWidth::Ddr4 | DataWidth::Ddr8)
    }

    pub fn is_4bit(self) -> bool {
        matches!(self, DataWidth::Bit4 | DataWidth::Ddr4)
    }

    pub fn is_8bit(self) -> bool {
        matches!(self, DataWidth::Bit8 | DataWidth::Ddr8)
    }

    /// Same number of lines, single data rate.
    pub fn sdr(self) -> Self {
        match self {
            DataWidth::Ddr4 => DataWidth::Bit4,
            DataWidth::Ddr8 => DataWidth::Bit8,
            other => other,
        }
    }

    pub fn lines(self) -> u8 {
        match self {
            DataWidth::Bit1 => 1,
            DataWidth::Bit4 | DataWidth::Ddr4 => 4,
            DataWidth::Bit8 | DataWidth::Ddr8 => 8,
        }
    }

    pub fn switch_value(self) -> u32 {
        self as u32
    }
}

/// Voltage window used for the first SEND_OP_COND.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoltageRange {
    Query,
    High,
    Dual,
    Low,
}

impl VoltageRange {
    /// Map a 2-bit fuse selection onto a range.
    pub fn from_fuse(value: u32) -> Self {
        match value & 0x3 {
            0 => VoltageRange::Query,
            1 => VoltageRange::High,
            2 => VoltageRange::Dual,
            _ => VoltageRange::Low,
        }
    }

    pub fn ocr_argument(self) -> u32 {
        match self {
            VoltageRange::Query => EMMC_OCR_QUERY_VOLTAGE,
            VoltageRange::High => EMMC_OCR_HIGH_VOLTAGE,
            VoltageRange::Dual => EMMC_OCR_DUAL_VOLTAGE,
            VoltageRange::Low => EMMC_OCR_LOW_VOLTAGE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootConfig {
    pub controller_id: u32,
    /// Controller clock divisor against the SDMMC PLL.
    pub clock_divisor: u32,
    pub data_width: DataWidth,
    pub voltage_range: VoltageRange,
    /// Highest power class the board can supply.
    pub max_power_class: u8,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            controller_id: 0,
            clock_divisor: 6,
            data_width: DataWidth::Bit8,
            voltage_range: VoltageRange::Query,
            max_power_class: 0,
        }
    }
}

impl BootConfig {
    /// Use a divisor expressed against the 432 MHz BCT reference. The boot
    /// clock runs at half that, so the divisor is halved (rounding up).
    pub fn with_bct_divisor(mut self, bct_divisor: u32) -> Self {
        self.clock_divisor = ((bct_divisor + 1) >> 1).max(1);
        self
    }

    pub fn with_data_width(mut self, width: DataWidth) -> Self {
        self.data_width = width;
        self
    }

    pub fn with_voltage_range(mut self, range: VoltageRange) -> Self {
        self.voltage_range = range;
        self
    }

    pub fn with_max_power_class(mut self, class: u8) -> Self {
        self.max_power_class = class;
        self
    }
}
