//! Line resets and transfer aborts after command or data faults.

use log::{debug, error, warn};

use super::constant::*;
use super::regs::{ClockControl, IntStatus, PresentState, RegisterIo};
use super::cmd::EMmcCommand;
use super::EMmcHost;
use crate::err::SdError;
use crate::platform::Platform;

/// Software reset targets in CLOCK_CONTROL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetLine {
    All,
    Cmd,
    Dat,
}

impl<R: RegisterIo, P: Platform> EMmcHost<R, P> {
    /// Request a software reset and wait for the hardware to clear it.
    pub(crate) fn reset_line(&self, line: ResetLine) -> Result<(), SdError> {
        let done = |reg: ClockControl| match line {
            ResetLine::All => reg.sw_reset_for_all() == 0,
            ResetLine::Cmd => reg.sw_reset_for_cmd_line() == 0,
            ResetLine::Dat => reg.sw_reset_for_dat_line() == 0,
        };

        self.modify(|reg: ClockControl| match line {
            ResetLine::All => reg.set_sw_reset_for_all(1),
            ResetLine::Cmd => reg.set_sw_reset_for_cmd_line(1),
            ResetLine::Dat => reg.set_sw_reset_for_dat_line(1),
        });

        self.wait_for(EMMC_POLL_TIMEOUT_US, |host| done(host.read::<ClockControl>()))
            .inspect_err(|_| error!("reset {:?} timed out", line))
    }

    pub(crate) fn reset_all(&self) -> Result<(), SdError> {
        self.reset_line(ResetLine::All)
    }

    fn data_lines_idle(&self) -> bool {
        self.read::<PresentState>().dat_3_0_line_level() == DAT_3_0_LINES_IDLE
    }

    /// Bring the controller back to a usable state after a failed command.
    pub fn recover(&mut self, is_data_command: bool) -> Result<(), SdError> {
        let status = self.int_status();
        debug!("recover: int status {:#x}, data command {}", status.bits(), is_data_command);

        if status.intersects(IntStatus::COMMAND_ERRORS) {
            self.reset_line(ResetLine::Cmd)?;
        }
        if status.intersects(IntStatus::DATA_ERRORS) {
            self.reset_line(ResetLine::Dat)?;
        }
        self.clear_int_status(status);

        if is_data_command {
            if let Err(err) = self.issue_abort_command() {
                warn!("abort after data error failed: {}", err);
            }
        }

        self.platform.wait_us(EMMC_RECOVERY_SETTLE_US);
        self.ensure_data_lines_idle()
    }

    /// One full controller re-init if DAT[3:0] are not all high.
    fn ensure_data_lines_idle(&mut self) -> Result<(), SdError> {
        if self.data_lines_idle() {
            return Ok(());
        }

        warn!("data lines busy, reinitializing controller");
        if let Err(err) = self.init_controller() {
            warn!("controller reinit failed: {}", err);
        }
        if self.data_lines_idle() {
            Ok(())
        } else {
            error!("error recovery failed");
            Err(SdError::NotInitialized)
        }
    }

    /// STOP_TRANSMISSION as an abort command. Each failed attempt costs a
    /// controller re-init.
    pub(crate) fn issue_abort_command(&mut self) -> Result<(), SdError> {
        let cmd = EMmcCommand::abort();
        let xfer = cmd.xfer_mode();

        let mut result = Err(SdError::Timeout);
        for _ in 0..EMMC_ABORT_RETRIES {
            self.issue(cmd.arg, xfer);
            result = self.wait_command_complete();
            if result.is_ok() {
                break;
            }
            if let Err(err) = self.init_controller() {
                warn!("controller reinit during abort failed: {}", err);
            }
        }
        result?;

        self.wait_cmd_inhibit_cmd()?;
        self.wait_cmd_inhibit_dat()?;
        self.response = self.read_response(cmd.resp_type).raw;
        Ok(())
    }

    /// Lighter reset used when a read fails in its command phase: reset the
    /// data line only. Failures are logged, the caller already has an error.
    pub(crate) fn abort_data_read(&mut self) {
        if self.reset_line(ResetLine::Dat).is_err() {
            error!("abort data read: data line reset timed out");
        }
        if self.data_lines_idle() {
            return;
        }
        if let Err(err) = self.init_controller() {
            warn!("controller reinit failed: {}", err);
        }
        if !self.data_lines_idle() {
            error!("abort data read: recovery failed");
        }
    }
}
