//! Card identification: from a reset controller to a card in transfer state
//! with negotiated speed, width and power class.

use log::{debug, error, info, warn};

use super::cmd::{EMmcCommand, ResponseType, VerifyPhase};
use super::constant::*;
use super::info::{Cid, Csd, ExtCsd};
use super::regs::{PowerControlHost, PresentState, RegisterIo};
use super::{AccessRegion, CardClock, CardInfo, DeviceStatus, EMmcHost};
use crate::config::DataWidth;
use crate::err::SdError;
use crate::platform::Platform;

/// Steps of the bring-up sequence, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BringUpStep {
    ClockIdentification,
    GoIdle,
    OpCondition,
    AllSendCid,
    SetRelativeAddress,
    ReadCsd,
    SelectCard,
    ConfirmTransferState,
    ReadExtCsd,
    SetPowerClass,
    EnableHighSpeed,
    DataTransferClock,
    SetBusWidth,
    SelectBootPartition,
    Ready,
}

impl<R: RegisterIo, P: Platform> EMmcHost<R, P> {
    /// Full bring-up: controller init, card detection, identification and
    /// negotiation. Any failing step fails the whole init.
    pub fn init(&mut self) -> Result<CardInfo, SdError> {
        info!("Init EMMC card");
        self.reset_session();

        self.init_controller()?;

        if !self.is_card_present() {
            warn!("no card detected");
            self.power_off();
            return Err(SdError::CardNotPresent);
        }

        self.identify_card()?;
        self.status = DeviceStatus::Idle;

        if self.needs_block_length() {
            self.set_block_length()?;
        }

        let info = self.card_info();
        info!(
            "EMMC ready: {} pages of {} bytes, width {:?}, high speed {}",
            info.pages,
            1u32 << info.page_size_log2,
            info.data_width,
            info.high_speed
        );
        debug!("{}", self);
        Ok(info)
    }

    /// Take over a card an earlier boot stage left selected and in transfer
    /// state. Only the extended CSD is read.
    pub fn attach_initialized(&mut self) -> Result<CardInfo, SdError> {
        info!("Attach to initialized EMMC card");
        self.reset_session();
        self.rca = EMMC_RCA;
        self.block_size_log2 = EMMC_BLOCK_SIZE_LOG2;
        self.page_size_log2 = EMMC_MAX_PAGE_SIZE_LOG2;
        self.pages_per_block_log2 = EMMC_BLOCK_SIZE_LOG2 - EMMC_MAX_PAGE_SIZE_LOG2;
        self.high_capacity = true;
        self.spec_version = CSD_SPEC_VERS_4;
        self.current_clock = CardClock::DataTransfer;
        self.data_width = self.host_data_width();

        self.read_ext_csd()?;
        Ok(self.card_info())
    }

    fn reset_session(&mut self) {
        self.taac = 0;
        self.nsac = 0;
        self.clock_divisor = self.config.clock_divisor;
        self.card_clock_divisor = 1;
        self.current_clock = CardClock::Identification;
        self.base_read_timeout_us = EMMC_READ_TIMEOUT_MIN_US;
        self.read_timeout_us = EMMC_READ_TIMEOUT_MIN_US;
        self.data_width = self.config.data_width;
        self.card_supports_high_speed = false;
        self.high_speed = false;
        self.high_voltage = false;
        self.ext_csd = ExtCsd::default();
        self.region = None;
        self.status = DeviceStatus::Idle;
        self.pages = 0;
    }

    /// Width the host side is currently programmed for.
    fn host_data_width(&self) -> DataWidth {
        let reg = self.read::<PowerControlHost>();
        if reg.extended_data_transfer_width() != 0 {
            DataWidth::Bit8
        } else if reg.data_xfer_width() != 0 {
            DataWidth::Bit4
        } else {
            DataWidth::Bit1
        }
    }

    fn is_card_present(&self) -> bool {
        let stable = self
            .wait_for(EMMC_POLL_TIMEOUT_US, |host| {
                host.read::<PresentState>().card_state_stable() != 0
            })
            .is_ok();
        let inserted = stable && self.read::<PresentState>().card_inserted() != 0;
        debug!("card stable: {}, inserted: {}", stable, inserted);
        inserted
    }

    /// CMD16 is only legal for single data rate transfers.
    pub(crate) fn needs_block_length(&self) -> bool {
        matches!(self.data_width, DataWidth::Bit4 | DataWidth::Bit8)
    }

    pub(crate) fn set_block_length(&mut self) -> Result<(), SdError> {
        let page_size = 1u32 << self.page_size_log2;
        self.send_command(&EMmcCommand::new(MMC_SET_BLOCKLEN, page_size, ResponseType::R1))?;
        self.verify_response(MMC_SET_BLOCKLEN, VerifyPhase::Response)
    }

    fn identify_card(&mut self) -> Result<(), SdError> {
        let mut step = BringUpStep::ClockIdentification;
        while step != BringUpStep::Ready {
            let current = step;
            step = self.run_step(current).inspect_err(|err| {
                error!("card bring-up failed at {:?}: {}", current, err);
            })?;
        }
        Ok(())
    }

    fn run_step(&mut self, step: BringUpStep) -> Result<BringUpStep, SdError> {
        use BringUpStep::*;

        debug!("bring-up step {:?}", step);
        let next = match step {
            ClockIdentification => {
                self.set_card_clock(CardClock::Identification)?;
                GoIdle
            }
            GoIdle => {
                self.send_command(&EMmcCommand::new(MMC_GO_IDLE_STATE, 0, ResponseType::None))?;
                OpCondition
            }
            OpCondition => {
                self.get_op_conditions()?;
                AllSendCid
            }
            AllSendCid => {
                let resp = self.send_command(&EMmcCommand::new(MMC_ALL_SEND_CID, 0, ResponseType::R2))?;
                self.cid = Cid::parse(&resp.as_r2());
                debug!("CID: {:?}", self.cid);
                SetRelativeAddress
            }
            SetRelativeAddress => {
                self.rca = EMMC_RCA;
                self.send_command(&EMmcCommand::new(MMC_SET_RELATIVE_ADDR, self.rca, ResponseType::R1))?;
                ReadCsd
            }
            ReadCsd => {
                self.read_csd()?;
                SelectCard
            }
            SelectCard => {
                self.send_command(&EMmcCommand::new(MMC_SELECT_CARD, self.rca, ResponseType::R1))?;
                ConfirmTransferState
            }
            ConfirmTransferState => {
                self.confirm_transfer_state()?;
                self.calculate_card_clock_divisor();
                if self.spec_version >= CSD_SPEC_VERS_4 {
                    ReadExtCsd
                } else {
                    DataTransferClock
                }
            }
            ReadExtCsd => {
                // Power class for wider buses is unknown until the extended
                // CSD is in, so read it at 1-bit and 20 MHz.
                self.set_host_data_width(DataWidth::Bit1);
                self.set_card_clock(CardClock::Fallback20MHz)?;
                self.read_ext_csd()?;
                SetPowerClass
            }
            SetPowerClass => {
                self.set_power_class()?;
                EnableHighSpeed
            }
            EnableHighSpeed => {
                self.enable_high_speed()?;
                DataTransferClock
            }
            DataTransferClock => {
                self.set_card_clock(CardClock::DataTransfer)?;
                SetBusWidth
            }
            SetBusWidth => {
                if self.spec_version >= CSD_SPEC_VERS_4 {
                    self.apply_data_width()?;
                } else {
                    // Pre-v4 cards have no SWITCH.
                    self.data_width = DataWidth::Bit1;
                    self.set_host_data_width(DataWidth::Bit1);
                }
                SelectBootPartition
            }
            SelectBootPartition => {
                let region = match self.ext_csd.boot_partition_enable() {
                    1 => Some(AccessRegion::BootPartition1),
                    2 => Some(AccessRegion::BootPartition2),
                    _ => None,
                };
                if let Some(region) = region.filter(|_| self.ext_csd.boot_partition_size != 0) {
                    self.select_access_region(region)?;
                }
                Ready
            }
            Ready => Ready,
        };
        Ok(next)
    }

    /// SEND_OP_COND until the card reports ready, settling the voltage
    /// window from its first answer.
    fn get_op_conditions(&mut self) -> Result<(), SdError> {
        let mut arg = self.config.voltage_range.ocr_argument();
        if arg != EMMC_OCR_QUERY_VOLTAGE {
            self.high_voltage = arg & EMMC_OCR_HIGH_VOLTAGE_MASK != 0;
            arg |= EMMC_OCR_SECTOR_MODE;
        }

        let mut start = self.platform.now_us();
        let ocr = loop {
            if self.platform.elapsed_us(start) > EMMC_OP_COND_TIMEOUT_US {
                error!("timeout waiting for SEND_OP_COND");
                return Err(SdError::Timeout);
            }

            let ocr = self
                .send_command(&EMmcCommand::new(MMC_SEND_OP_COND, arg, ResponseType::R3))?
                .as_r3();
            if ocr & EMMC_OCR_READY != 0 {
                break ocr;
            }

            if arg == EMMC_OCR_QUERY_VOLTAGE {
                if ocr & EMMC_OCR_HIGH_VOLTAGE_MASK != 0 {
                    arg = EMMC_OCR_HIGH_VOLTAGE;
                    self.high_voltage = true;
                } else if ocr & EMMC_OCR_LOW_VOLTAGE_MASK != 0 {
                    arg = EMMC_OCR_LOW_VOLTAGE;
                    self.high_voltage = false;
                } else {
                    continue;
                }
                arg |= EMMC_OCR_SECTOR_MODE;
                start = self.platform.now_us();
                continue;
            }

            self.platform.wait_us(EMMC_OP_COND_RETRY_DELAY_US);
        };

        self.high_capacity = ocr & EMMC_OCR_SECTOR_MODE != 0;
        debug!(
            "OCR {:#x}: high capacity {}, high voltage {}",
            ocr, self.high_capacity, self.high_voltage
        );
        Ok(())
    }

    fn read_csd(&mut self) -> Result<(), SdError> {
        let resp = self.send_command(&EMmcCommand::new(MMC_SEND_CSD, self.rca, ResponseType::R2))?;
        let csd = Csd::parse(&resp.as_r2());
        debug!("CSD: {:?}", csd);

        self.page_size_log2 = csd.page_size_log2().ok_or(SdError::NotInitialized)?;
        self.block_size_log2 = EMMC_BLOCK_SIZE_LOG2;
        self.pages_per_block_log2 = self.block_size_log2 - self.page_size_log2;
        self.spec_version = csd.spec_version;
        self.taac = csd.taac;
        self.nsac = csd.nsac;
        self.tran_speed_mhz = csd.tran_speed_mhz(self.family);
        if csd.supports_high_speed() {
            self.card_supports_high_speed = true;
        }

        match csd.capacity_pages(self.page_size_log2) {
            Some(pages) => self.pages = pages,
            None => debug!("capacity above 2 GB, taken from EXT_CSD"),
        }
        Ok(())
    }

    /// The card must be in transfer state before anything else is sent.
    pub(crate) fn confirm_transfer_state(&mut self) -> Result<(), SdError> {
        let status = self.send_status().map_err(|err| {
            error!("SEND_STATUS failed: {}", err);
            SdError::CardNotPresent
        })?;
        match CardStatus::state(status) {
            CardState::Tran => Ok(()),
            state => {
                error!("card in {:?} state, expected Tran", state);
                Err(SdError::CardNotPresent)
            }
        }
    }

    /// Read the extended CSD into the session over the current bus.
    pub fn read_ext_csd(&mut self) -> Result<(), SdError> {
        let address = self.platform.dma_address(&mut self.ext_csd_raw);
        self.setup_dma(EXT_CSD_SIZE as u32, 1, address);
        self.launch_read(&EMmcCommand::new(MMC_SEND_EXT_CSD, 0, ResponseType::R1).with_data())?;

        if let Err(err) = self.wait_for_idle() {
            error!("EXT_CSD read failed: {}", err);
            return Err(SdError::CardNotPresent);
        }

        self.ext_csd = ExtCsd::parse(&self.ext_csd_raw);
        if self.high_capacity {
            self.pages = self.ext_csd.sector_count;
        }
        debug!("EXT_CSD: {:?}", self.ext_csd);
        Ok(())
    }
}
