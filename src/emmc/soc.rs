//! Per-family controller parameters, chosen once from the chip id.

use log::warn;

/// Controller and card clock divisors for one clock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Divisors {
    pub controller: u32,
    pub card: u32,
}

pub trait SiliconFamily {
    fn name(&self) -> &'static str;

    /// Frequency of the PLL feeding the controller's source divider.
    fn pll_mhz(&self) -> u32 {
        216
    }

    /// 216 / 9 / 64 gives the 375 kHz identification clock.
    fn identification_divisors(&self) -> Divisors {
        Divisors { controller: 9, card: 64 }
    }

    fn fallback_20mhz_divisors(&self) -> Divisors {
        Divisors { controller: 11, card: 1 }
    }

    /// `None` means the divisors negotiated for the card are used.
    fn fixed_transfer_divisors(&self) -> Option<Divisors> {
        None
    }

    /// Delay after command completion before the inhibit poll. Empirical:
    /// without it stale response data is read on these revisions.
    fn post_command_settle_us(&self) -> u32;

    /// Encode a controller divisor for the 7.1 source divider field.
    fn source_divider_field(&self, divisor: u32) -> u32 {
        divisor.saturating_sub(1) << 1
    }

    /// Vendor refinement of the v4.3+ TRAN_SPEED encoding.
    fn refine_v43_tran_speed(&self, mhz: u32) -> u32 {
        if mhz == 25 { 26 } else { mhz }
    }
}

const T30_COMMAND_SETTLE_US: u32 = 400;
const T1XX_COMMAND_SETTLE_US: u32 = 400;

#[derive(Debug)]
pub struct T30;

impl SiliconFamily for T30 {
    fn name(&self) -> &'static str {
        "T30"
    }

    fn post_command_settle_us(&self) -> u32 {
        T30_COMMAND_SETTLE_US
    }
}

/// T114, T124, T148 and T132.
#[derive(Debug)]
pub struct T1xx;

impl SiliconFamily for T1xx {
    fn name(&self) -> &'static str {
        "T1xx"
    }

    fn post_command_settle_us(&self) -> u32 {
        T1XX_COMMAND_SETTLE_US
    }
}

/// FPGA emulation: slow fixed clocks regardless of what the card reports.
#[cfg(feature = "fpga")]
#[derive(Debug)]
pub struct Fpga;

#[cfg(feature = "fpga")]
impl SiliconFamily for Fpga {
    fn name(&self) -> &'static str {
        "FPGA"
    }

    fn identification_divisors(&self) -> Divisors {
        Divisors { controller: 2, card: 18 }
    }

    fn fallback_20mhz_divisors(&self) -> Divisors {
        Divisors { controller: 8, card: 1 }
    }

    fn fixed_transfer_divisors(&self) -> Option<Divisors> {
        Some(Divisors { controller: 8, card: 2 })
    }

    fn post_command_settle_us(&self) -> u32 {
        T1XX_COMMAND_SETTLE_US
    }
}

pub const CHIP_ID_T30: u32 = 0x30;
pub const CHIP_ID_T114: u32 = 0x35;
pub const CHIP_ID_T124: u32 = 0x40;
pub const CHIP_ID_T132: u32 = 0x13;
pub const CHIP_ID_T148: u32 = 0x14;

static T30_FAMILY: T30 = T30;
static T1XX_FAMILY: T1xx = T1xx;

#[cfg(not(feature = "fpga"))]
pub fn select_family(chip_id: u32) -> &'static dyn SiliconFamily {
    match chip_id {
        CHIP_ID_T30 => &T30_FAMILY,
        CHIP_ID_T114 | CHIP_ID_T124 | CHIP_ID_T132 | CHIP_ID_T148 => &T1XX_FAMILY,
        other => {
            warn!("unknown chip id {:#x}, assuming T1xx controller", other);
            &T1XX_FAMILY
        }
    }
}

#[cfg(feature = "fpga")]
static FPGA_FAMILY: Fpga = Fpga;

#[cfg(feature = "fpga")]
pub fn select_family(chip_id: u32) -> &'static dyn SiliconFamily {
    warn!("fpga build, ignoring chip id {:#x}", chip_id);
    &FPGA_FAMILY
}
