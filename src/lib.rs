#![cfg_attr(not(test), no_std)]

//! Boot-time eMMC driver for Tegra SDMMC controllers.
//!
//! The driver runs without interrupts or a scheduler: every wait is a bounded
//! busy-poll against a microsecond timer, and block reads are started and then
//! polled to completion through [`emmc::EMmcHost::query_status`].

pub mod config;
pub mod emmc;
pub mod err;
pub mod platform;

pub use config::{BootConfig, DataWidth, VoltageRange};
pub use emmc::{AccessRegion, CardInfo, DeviceStatus, EMmcHost};
pub use err::{ProtocolError, SdError};
pub use platform::{ClockReset, Platform, Timer};
