//! Speed, bus width and power class negotiation with a v4+ card.

use log::{debug, info, warn};

use super::constant::*;
use super::info::ExtCsd;
use super::regs::{Capabilities, CapabilitiesHigher, ClockControl, HostControl2, PowerControlHost, RegisterIo};
use super::{CardClock, EMmcHost};
use crate::config::DataWidth;
use crate::err::SdError;
use crate::platform::Platform;

/// Power class the card needs for `width` at the given speed and voltage.
pub fn required_power_class(ext: &ExtCsd, width: DataWidth, high_speed: bool, high_voltage: bool) -> u8 {
    let classes = if width.is_ddr() {
        if high_voltage {
            ext.power_class_ddr_52_360
        } else {
            ext.power_class_ddr_52_195
        }
    } else {
        match (high_voltage, high_speed) {
            (true, true) => ext.power_class_52_360,
            (true, false) => ext.power_class_26_360,
            (false, true) => ext.power_class_52_195,
            (false, false) => ext.power_class_26_195,
        }
    };

    // Low nibble covers 4-bit, high nibble 8-bit.
    if width.is_4bit() {
        classes & 0xF
    } else if width.is_8bit() {
        classes >> 4
    } else {
        0
    }
}

impl<R: RegisterIo, P: Platform> EMmcHost<R, P> {
    fn power_class(&self) -> u8 {
        required_power_class(&self.ext_csd, self.data_width, self.high_speed, self.high_voltage)
    }

    /// One degradation step: high speed goes first, then 8-bit to 4-bit,
    /// then 4-bit to 1-bit. Returns false when nothing is left to give up.
    pub(crate) fn degrade_power_step(&mut self) -> bool {
        if self.high_speed {
            self.card_supports_high_speed = false;
            self.calculate_card_clock_divisor();
        } else if self.data_width.is_8bit() {
            self.data_width = DataWidth::Bit4;
        } else if self.data_width.is_4bit() {
            self.data_width = DataWidth::Bit1;
        } else {
            return false;
        }
        debug!("power class degraded: hs {}, width {:?}", self.high_speed, self.data_width);
        true
    }

    /// Bring the required power class within what the board supplies, then
    /// tell the card.
    pub fn set_power_class(&mut self) -> Result<(), SdError> {
        let max = self.config.max_power_class;
        let mut class = self.power_class();
        while class > max {
            if !self.degrade_power_step() {
                break;
            }
            class = self.power_class();
        }

        if class != 0 {
            info!("set power class {}", class);
            self.send_switch(EMMC_SWITCH_POWER_CLASS_ARG | ((class as u32) << 8))?;
        }
        Ok(())
    }

    /// Switch the card to the session's width, then the host.
    pub fn set_bus_width(&mut self) -> Result<(), SdError> {
        info!("set data width {:?}", self.data_width);
        self.send_switch(EMMC_SWITCH_BUS_WIDTH_ARG | (self.data_width.switch_value() << 8))?;
        self.set_host_data_width(self.data_width);
        Ok(())
    }

    /// The host high speed bit stays off: setting it breaks reads on these
    /// controllers.
    pub(crate) fn clear_host_high_speed(&self) {
        self.modify(|reg: PowerControlHost| reg.set_high_speed_en(0));
    }

    /// Switch the card to high speed timing if negotiated, and fall back to
    /// normal speed if the card does not confirm it.
    pub fn enable_high_speed(&mut self) -> Result<(), SdError> {
        self.clear_host_high_speed();
        if !self.high_speed {
            return Ok(());
        }

        match self.try_high_speed() {
            Ok(true) => {
                info!("high speed timing enabled");
                return Ok(());
            }
            Ok(false) => warn!("card did not take HS_TIMING"),
            Err(err) => warn!("high speed switch failed: {}", err),
        }

        self.card_supports_high_speed = false;
        self.calculate_card_clock_divisor();
        Ok(())
    }

    fn try_high_speed(&mut self) -> Result<bool, SdError> {
        self.send_switch(EMMC_SWITCH_HIGH_SPEED_ARG)?;
        self.set_card_clock(CardClock::DataTransfer)?;
        self.read_ext_csd()?;
        Ok(self.ext_csd.hs_timing != 0)
    }

    /// Switch to a DDR width. UHS DDR50 is only programmed when the host
    /// advertises it together with 1.8 V and high speed.
    pub fn enable_ddr(&mut self) -> Result<(), SdError> {
        if !self.ext_csd.supports_ddr_52_180_300() {
            return Err(SdError::Unsupported);
        }

        self.set_bus_width()?;

        let caps = self.read::<Capabilities>();
        let caps_higher = self.read::<CapabilitiesHigher>();
        if caps_higher.ddr50() != 0 && caps.voltage_support_1v8() != 0 && caps.high_speed_support() != 0 {
            self.modify(|reg: ClockControl| reg.set_sd_clock_en(0));
            self.modify(|reg: HostControl2| reg.set_uhs_mode_sel(UHS_MODE_DDR50));
            self.modify(|reg: ClockControl| reg.set_sd_clock_en(1));
            info!("UHS DDR50 enabled");
        }
        Ok(())
    }

    /// Apply the requested width, substituting SDR when the card cannot do
    /// DDR at 1.8/3.0 V.
    pub(crate) fn apply_data_width(&mut self) -> Result<(), SdError> {
        if self.data_width.is_ddr() {
            if self.ext_csd.supports_ddr_52_180_300() {
                return self.enable_ddr();
            }
            debug!("card type {:#x} has no DDR52 at 1.8/3.0 V", self.ext_csd.card_type);
            self.data_width = self.data_width.sdr();
        }
        self.set_bus_width()
    }
}
