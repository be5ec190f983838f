//! Controller bring-up, card clock programming and the data timeout counter.

use log::{debug, info};

use super::aux::{access_time_us, clamp_read_timeout, quotient_ceiling};
use super::constant::*;
use super::regs::{Capabilities, ClockControl, IntStatus, PowerControlHost, RegisterIo, INTERRUPT_STATUS_ENABLE};
use super::soc::Divisors;
use super::{CardClock, EMmcHost};
use crate::config::DataWidth;
use crate::err::SdError;
use crate::platform::Platform;

/// Timeout counter setting derived for one clock configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataTimeout {
    /// DATA_TIMEOUT_COUNTER_VALUE: the controller waits `2^(13 + counter)` cycles.
    pub counter: u32,
    /// Software read timeout matching the counter, clamped.
    pub read_timeout_us: u32,
}

/// Pick the smallest counter covering `required_us` at `pll_mhz / controller_divisor`.
pub fn compute_data_timeout(required_us: u32, pll_mhz: u32, controller_divisor: u32) -> DataTimeout {
    let cycles_required = (required_us as u64 * pll_mhz as u64).div_ceil(controller_divisor as u64);

    let mut counter = 0;
    while cycles_required > 1u64 << (DATA_TIMEOUT_COUNTER_BASE_LOG2 + counter) {
        counter += 1;
        if counter == DATA_TIMEOUT_COUNTER_MAX {
            break;
        }
    }

    // Software must not give up before the controller does.
    let cycles = 1u64 << (DATA_TIMEOUT_COUNTER_BASE_LOG2 + counter);
    let hw_us = (cycles * controller_divisor as u64).div_ceil(pll_mhz as u64)
        + EMMC_READ_TIMEOUT_MARGIN_US as u64;
    let hw_us = hw_us.min(u32::MAX as u64) as u32;

    DataTimeout {
        counter,
        read_timeout_us: clamp_read_timeout(hw_us, EMMC_READ_TIMEOUT_MIN_US, EMMC_READ_TIMEOUT_MAX_US),
    }
}

impl<R: RegisterIo, P: Platform> EMmcHost<R, P> {
    fn divisors_for(&self, mode: CardClock) -> Divisors {
        match mode {
            CardClock::Identification => self.family.identification_divisors(),
            CardClock::DataTransfer => self.family.fixed_transfer_divisors().unwrap_or(Divisors {
                controller: self.clock_divisor,
                card: self.card_clock_divisor,
            }),
            CardClock::Fallback20MHz => self.family.fallback_20mhz_divisors(),
        }
    }

    /// Reprogram the card clock for `mode` and recompute the read timeout.
    pub fn set_card_clock(&mut self, mode: CardClock) -> Result<(), SdError> {
        self.current_clock = mode;
        let div = self.divisors_for(mode);
        let pll_mhz = self.family.pll_mhz();

        // Gate the card clock while the frequency changes.
        self.modify(|reg: ClockControl| reg.set_sd_clock_en(0));

        let card_mhz = quotient_ceiling(pll_mhz, div.controller * div.card);
        let card_cycle_ns = quotient_ceiling(1000, card_mhz);
        let required_us = if self.taac != 0 {
            let access = access_time_us(self.taac, self.nsac, card_cycle_ns);
            debug!("card access time {}us", access);
            clamp_read_timeout(access, EMMC_READ_TIMEOUT_MIN_US, EMMC_READ_TIMEOUT_MAX_US)
        } else {
            self.base_read_timeout_us
        };

        debug!(
            "set_card_clock {:?}: base clock {}MHz, card div {}",
            mode,
            quotient_ceiling(pll_mhz, div.controller),
            div.card
        );

        self.platform
            .set_source_divider(self.family.source_divider_field(div.controller));

        // SDCLK_FREQUENCYSELECT holds half the card divisor.
        self.modify(|reg: ClockControl| reg.set_sdclk_frequency_select(div.card >> 1));
        self.wait_for_clock_stable()?;

        let timeout = compute_data_timeout(required_us, pll_mhz, div.controller);
        self.read_timeout_us = timeout.read_timeout_us;
        self.modify(|reg: ClockControl| {
            reg.set_sd_clock_en(1)
                .set_data_timeout_counter_value(timeout.counter)
        });

        debug!(
            "timeout counter {}, read timeout {}us",
            timeout.counter, self.read_timeout_us
        );
        Ok(())
    }

    pub(crate) fn wait_for_clock_stable(&self) -> Result<(), SdError> {
        self.wait_for(EMMC_POLL_TIMEOUT_US, |host| {
            host.read::<ClockControl>().internal_clock_stable() != 0
        })
    }

    /// Choose the card clock divisor for data transfer and decide whether
    /// high speed timing is used.
    pub(crate) fn calculate_card_clock_divisor(&mut self) {
        let pll_mhz = self.family.pll_mhz();
        self.card_clock_divisor = 1;
        self.high_speed = false;

        if !self.host_supports_high_speed
            || !self.card_supports_high_speed
            || self.spec_version < CSD_SPEC_VERS_4
        {
            if quotient_ceiling(pll_mhz, self.clock_divisor) > self.tran_speed_mhz {
                self.clock_divisor = quotient_ceiling(pll_mhz, self.tran_speed_mhz);
            }
        } else {
            let mut total = self.clock_divisor * self.card_clock_divisor;
            while quotient_ceiling(pll_mhz, total) > EMMC_MAX_CLOCK_MHZ {
                self.card_clock_divisor <<= 1;
                total = self.clock_divisor * self.card_clock_divisor;
            }
            self.high_speed = quotient_ceiling(pll_mhz, total) > self.tran_speed_mhz;
        }

        debug!(
            "clock divisor {}, card clock divisor {}, high speed {}",
            self.clock_divisor, self.card_clock_divisor, self.high_speed
        );
    }

    /// Program the host side of the data bus width.
    pub(crate) fn set_host_data_width(&self, width: DataWidth) {
        self.modify(|reg: PowerControlHost| {
            reg.set_data_xfer_width(width.is_4bit() as u32)
                .set_extended_data_transfer_width(width.is_8bit() as u32)
        });
    }

    /// Reset the controller and bring it up to the point where commands can
    /// be issued at the current card clock.
    pub fn init_controller(&mut self) -> Result<(), SdError> {
        info!("Init EMMC Controller");

        let div = self.family.identification_divisors();
        self.platform.set_reset(true);
        self.platform
            .set_source_divider(self.family.source_divider_field(div.controller));
        self.platform.set_clock_enable(true);
        self.platform.set_reset(false);

        self.reset_all()?;

        self.write(
            ClockControl(0)
                .set_internal_clock_en(1)
                .set_sdclk_frequency_select(SDCLK_FREQUENCY_DIV64),
        );
        self.wait_for_clock_stable()?;

        let caps = self.read::<Capabilities>();
        let voltage = if caps.voltage_support_3v3() != 0 {
            SD_BUS_VOLTAGE_V3_3
        } else if caps.voltage_support_3v0() != 0 {
            SD_BUS_VOLTAGE_V3_0
        } else {
            SD_BUS_VOLTAGE_V1_8
        };
        self.write(
            PowerControlHost(0)
                .set_sd_bus_voltage_select(voltage)
                .set_sd_bus_power(1),
        );

        self.host_supports_high_speed = caps.high_speed_support() != 0;
        debug!("host supports high speed: {}", self.host_supports_high_speed);

        let enable = IntStatus::CMD_COMPLETE
            | IntStatus::XFER_COMPLETE
            | IntStatus::DMA_INTERRUPT
            | IntStatus::CARD_INSERTION
            | IntStatus::CARD_REMOVAL
            | IntStatus::COMMAND_ERRORS
            | IntStatus::DATA_ERRORS;
        self.regs.write32(INTERRUPT_STATUS_ENABLE, enable.bits());

        // The reset cleared the card clock divisor.
        self.set_card_clock(self.current_clock)
    }
}
