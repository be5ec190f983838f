//! The controller session and everything that drives it.

pub mod aux;
pub mod block;
pub mod clock;
pub mod cmd;
pub mod constant;
pub mod ident;
pub mod info;
pub mod negotiate;
pub mod recovery;
pub mod regs;
pub mod soc;

#[cfg(test)]
pub(crate) mod sim;

use core::fmt::{self, Display};

use log::info;

use crate::config::{BootConfig, DataWidth};
use crate::err::SdError;
use crate::platform::Platform;
use constant::*;
use info::{Cid, ExtCsd};
use regs::{ClockControl, PowerControlHost, RegisterIo};
use soc::SiliconFamily;

/// Card clock configurations the driver switches between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardClock {
    /// ~375 kHz, used until the card has an address.
    Identification,
    /// Negotiated divisors.
    DataTransfer,
    /// 20 MHz, safe for any card before power class is known.
    Fallback20MHz,
}

/// Outcome of the most recent block transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Idle,
    ReadInProgress,
    CrcFailure,
    DataTimeout,
    ReadFailure,
}

/// Physical window a logical block maps into. Discriminants are the
/// PARTITION_ACCESS values written with SWITCH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessRegion {
    UserArea = 0,
    BootPartition1 = 1,
    BootPartition2 = 2,
}

/// Summary of a card after bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardInfo {
    pub cid: Cid,
    /// Capacity in pages of `1 << page_size_log2` bytes.
    pub pages: u32,
    pub block_size_log2: u32,
    pub page_size_log2: u32,
    pub spec_version: u32,
    pub high_capacity: bool,
    pub data_width: DataWidth,
    pub high_speed: bool,
    /// Size of each boot partition in bytes, 0 if there are none.
    pub boot_partition_size: u32,
}

/// One live controller session.
pub struct EMmcHost<R: RegisterIo, P: Platform> {
    regs: R,
    platform: P,
    family: &'static dyn SiliconFamily,
    config: BootConfig,

    block_size_log2: u32,
    page_size_log2: u32,
    pages_per_block_log2: u32,

    clock_divisor: u32,
    card_clock_divisor: u32,
    current_clock: CardClock,
    // Requirement the timeout counter is derived from; never the clamped result.
    base_read_timeout_us: u32,
    read_timeout_us: u32,

    rca: u32,
    high_capacity: bool,
    high_voltage: bool,
    spec_version: u32,
    taac: u8,
    nsac: u8,
    tran_speed_mhz: u32,
    pages: u32,
    cid: Cid,

    data_width: DataWidth,
    host_supports_high_speed: bool,
    card_supports_high_speed: bool,
    high_speed: bool,

    ext_csd_raw: [u8; EXT_CSD_SIZE],
    ext_csd: ExtCsd,
    region: Option<AccessRegion>,

    status: DeviceStatus,
    read_start_us: u32,
    response: [u32; 4],
}

impl<R: RegisterIo, P: Platform> Display for EMmcHost<R, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EMMC Controller {{ family: {}, rca: {:#x}, width: {:?}, hs: {}, clock: {:?} div {}/{}, read timeout: {}us }}",
            self.family.name(),
            self.rca,
            self.data_width,
            self.high_speed,
            self.current_clock,
            self.clock_divisor,
            self.card_clock_divisor,
            self.read_timeout_us
        )
    }
}

impl<R: RegisterIo, P: Platform> EMmcHost<R, P> {
    /// Bind a session to a controller. Nothing is written to the hardware
    /// until [`EMmcHost::init`] or [`EMmcHost::attach_initialized`].
    pub fn new(regs: R, platform: P, mut config: BootConfig) -> Self {
        let family = soc::select_family(platform.chip_id());
        // A zero divisor would stop the controller clock.
        config.clock_divisor = config.clock_divisor.max(1);

        let host = Self {
            regs,
            platform,
            family,
            config,
            block_size_log2: EMMC_BLOCK_SIZE_LOG2,
            page_size_log2: EMMC_MAX_PAGE_SIZE_LOG2,
            pages_per_block_log2: EMMC_BLOCK_SIZE_LOG2 - EMMC_MAX_PAGE_SIZE_LOG2,
            clock_divisor: config.clock_divisor,
            card_clock_divisor: 1,
            current_clock: CardClock::Identification,
            base_read_timeout_us: EMMC_READ_TIMEOUT_MIN_US,
            read_timeout_us: EMMC_READ_TIMEOUT_MIN_US,
            rca: 0,
            high_capacity: false,
            high_voltage: false,
            spec_version: 0,
            taac: 0,
            nsac: 0,
            tran_speed_mhz: EMMC_TRAN_SPEED_DEFAULT_MHZ,
            pages: 0,
            cid: Cid::default(),
            data_width: config.data_width,
            host_supports_high_speed: false,
            card_supports_high_speed: false,
            high_speed: false,
            ext_csd_raw: [0; EXT_CSD_SIZE],
            ext_csd: ExtCsd::default(),
            region: None,
            status: DeviceStatus::Idle,
            read_start_us: 0,
            response: [0; 4],
        };

        info!("EMMC Controller created: {}", host);

        host
    }

    pub fn config(&self) -> &BootConfig {
        &self.config
    }

    pub fn family(&self) -> &'static dyn SiliconFamily {
        self.family
    }

    /// `(block_size_log2, page_size_log2)`.
    pub fn get_block_sizes(&self) -> (u32, u32) {
        (self.block_size_log2, self.page_size_log2)
    }

    pub fn pages_per_block_log2(&self) -> u32 {
        self.pages_per_block_log2
    }

    pub fn read_timeout_us(&self) -> u32 {
        self.read_timeout_us
    }

    pub fn current_clock(&self) -> CardClock {
        self.current_clock
    }

    pub fn clock_divisors(&self) -> (u32, u32) {
        (self.clock_divisor, self.card_clock_divisor)
    }

    pub fn data_width(&self) -> DataWidth {
        self.data_width
    }

    pub fn high_speed(&self) -> bool {
        self.high_speed
    }

    pub fn card_supports_high_speed(&self) -> bool {
        self.card_supports_high_speed
    }

    pub fn current_region(&self) -> Option<AccessRegion> {
        self.region
    }

    pub fn ext_csd(&self) -> &ExtCsd {
        &self.ext_csd
    }

    /// Response words of the last command.
    pub fn response(&self) -> &[u32; 4] {
        &self.response
    }

    pub fn card_info(&self) -> CardInfo {
        CardInfo {
            cid: self.cid,
            pages: self.pages,
            block_size_log2: self.block_size_log2,
            page_size_log2: self.page_size_log2,
            spec_version: self.spec_version,
            high_capacity: self.high_capacity,
            data_width: self.data_width,
            high_speed: self.high_speed,
            boot_partition_size: self.ext_csd.boot_partition_size,
        }
    }

    /// Power the card down and release the hardware. The session is gone
    /// afterwards; a new one must run the full bring-up again.
    pub fn shutdown(self) -> (R, P) {
        info!("EMMC shutdown");
        self.power_off();
        (self.regs, self.platform)
    }

    pub(crate) fn power_off(&self) {
        self.modify(|reg: ClockControl| reg.set_sd_clock_en(0));
        self.modify(|reg: PowerControlHost| reg.set_sd_bus_power(0));
        self.platform.set_reset(true);
        self.platform.set_clock_enable(false);
    }

    /// Busy-poll `done` until it holds or `budget_us` has elapsed.
    pub(crate) fn wait_for(&self, budget_us: u32, mut done: impl FnMut(&Self) -> bool) -> Result<(), SdError> {
        let start = self.platform.now_us();
        loop {
            if done(self) {
                return Ok(());
            }
            if self.platform.elapsed_us(start) > budget_us {
                return Err(SdError::Timeout);
            }
        }
    }
}
