// ===== Block Transfer Interface =====

use log::{debug, error, info, warn};

use crate::err::SdError;
use crate::platform::Platform;

use super::cmd::{EMmcCommand, ResponseType, VerifyPhase};
use super::constant::*;
use super::regs::{BlockSizeBlockCount, IntStatus, PresentState, RegisterIo, SystemAddress};
use super::{AccessRegion, DeviceStatus, EMmcHost};

/// Map a logical block onto the region holding it. With boot partitions the
/// logical space is boot partition 1, then boot partition 2, then the user
/// area.
pub fn translate_block(block: u32, boot_partition_size: u32, block_size_log2: u32) -> (AccessRegion, u32) {
    let per_partition = boot_partition_size >> block_size_log2;
    if per_partition == 0 {
        (AccessRegion::UserArea, block)
    } else if block < per_partition {
        (AccessRegion::BootPartition1, block)
    } else if block < per_partition << 1 {
        (AccessRegion::BootPartition2, block - per_partition)
    } else {
        (AccessRegion::UserArea, block - (per_partition << 1))
    }
}

impl<R: RegisterIo, P: Platform> EMmcHost<R, P> {
    /// Point PARTITION_ACCESS at `region`.
    pub fn select_access_region(&mut self, region: AccessRegion) -> Result<(), SdError> {
        let config = (self.ext_csd.partition_config as u32 & !EMMC_PARTITION_ACCESS_MASK) | region as u32;
        info!("select access region {:?}", region);
        self.send_switch(EMMC_SWITCH_PARTITION_ARG | (config << 8))?;
        self.ext_csd.partition_config = config as u8;
        self.region = Some(region);
        Ok(())
    }

    fn region_block(&mut self, block: u32) -> Result<u32, SdError> {
        let size = self.ext_csd.boot_partition_size;
        if size == 0 {
            // No boot partitions, or a card older than v4.3.
            self.region = Some(AccessRegion::UserArea);
            return Ok(block);
        }

        let (region, block) = translate_block(block, size, self.block_size_log2);
        if self.region != Some(region) {
            self.select_access_region(region)?;
        }
        Ok(block)
    }

    fn check_read(&self, page: u32, count: u32, buffer: &[u8]) -> Result<(), SdError> {
        let needed = (count as usize) << self.page_size_log2;
        // BLOCK_COUNT and the SET_BLOCK_COUNT argument are both 16 bits wide.
        let count_fits = count != 0 && count <= u16::MAX as u32;
        if page >= 1 << self.pages_per_block_log2 || !count_fits || buffer.len() < needed {
            warn!(
                "bad read: page {}, count {}, buffer {} bytes",
                page,
                count,
                buffer.len()
            );
            return Err(SdError::BadParameter);
        }
        Ok(())
    }

    /// Everything a read does before the read command itself. Returns the
    /// command argument.
    fn prepare_read(&mut self, block: u32, page: u32) -> Result<u32, SdError> {
        let ready = self.wait_for(self.read_timeout_us, |host| {
            host.read::<PresentState>().dat_line_active() == 0
        });
        if ready.is_err() {
            warn!("data line busy before read, recovering");
            self.recover(true)?;
        }

        let block = self.region_block(block)?;
        debug!("read region {:?} block {} page {}", self.region, block, page);

        if self.needs_block_length() {
            self.set_block_length()?;
        }

        let page_index = (block << self.pages_per_block_log2) + page;
        Ok(if self.high_capacity {
            page_index
        } else {
            page_index << self.page_size_log2
        })
    }

    /// Program block geometry and the SDMA destination.
    pub(crate) fn setup_dma(&self, block_size: u32, count: u32, address: u32) {
        self.write(
            BlockSizeBlockCount(0)
                .set_xfer_block_size(block_size)
                .set_host_dma_buffer_size(HOST_DMA_BUFFER_SIZE_DMA512K)
                .set_blocks_count(count),
        );
        debug!("DMA {} x {} bytes to {:#x}", count, block_size, address);
        self.write(SystemAddress(address));
    }

    /// Send a data command and leave the transfer running. A failed or
    /// rejected command costs a data line abort.
    pub(crate) fn launch_read(&mut self, cmd: &EMmcCommand) -> Result<(), SdError> {
        let sent = self
            .send_command(cmd)
            .and_then(|_| self.verify_response(cmd.opcode, VerifyPhase::Response));
        if let Err(err) = sent {
            self.abort_data_read();
            return Err(err);
        }
        self.status = DeviceStatus::ReadInProgress;
        self.read_start_us = self.platform.now_us();
        Ok(())
    }

    /// Start reading one page. Completion is reported by
    /// [`EMmcHost::query_status`].
    ///
    /// # Safety
    ///
    /// The controller keeps writing into `buffer` after this returns. The
    /// buffer must stay alive and untouched until `query_status` reports
    /// anything other than [`DeviceStatus::ReadInProgress`].
    pub unsafe fn read_page(&mut self, block: u32, page: u32, buffer: &mut [u8]) -> Result<(), SdError> {
        self.check_read(page, 1, buffer)?;
        let arg = self.prepare_read(block, page)?;
        debug!("CMD17 arg {:#x}", arg);

        let address = self.platform.dma_address(buffer);
        self.setup_dma(1 << self.page_size_log2, 1, address);
        let cmd = EMmcCommand::new(MMC_READ_SINGLE_BLOCK, arg, ResponseType::R1).with_data();
        self.launch_read(&cmd)
    }

    /// Start reading `count` consecutive pages.
    ///
    /// # Safety
    ///
    /// Same contract as [`EMmcHost::read_page`].
    pub unsafe fn read_multi_page(
        &mut self,
        block: u32,
        page: u32,
        count: u32,
        buffer: &mut [u8],
    ) -> Result<(), SdError> {
        self.check_read(page, count, buffer)?;
        let arg = self.prepare_read(block, page)?;
        debug!("CMD18 arg {:#x}, {} pages", arg, count);

        let address = self.platform.dma_address(buffer);
        self.setup_dma(1 << self.page_size_log2, count, address);
        if let Err(err) = self.send_command(&EMmcCommand::new(MMC_SET_BLOCK_COUNT, count, ResponseType::R1)) {
            self.abort_data_read();
            return Err(err);
        }
        let cmd = EMmcCommand::new(MMC_READ_MULTIPLE_BLOCK, arg, ResponseType::R1).with_data();
        self.launch_read(&cmd)
    }

    /// Read one page and wait for it to land.
    pub fn read_page_blocking(&mut self, block: u32, page: u32, buffer: &mut [u8]) -> Result<(), SdError> {
        // SAFETY: `buffer` stays borrowed until the transfer has finished or
        // been aborted.
        unsafe { self.read_page(block, page, buffer)? };
        self.finish_blocking_read()
    }

    pub fn read_multi_page_blocking(
        &mut self,
        block: u32,
        page: u32,
        count: u32,
        buffer: &mut [u8],
    ) -> Result<(), SdError> {
        // SAFETY: as in `read_page_blocking`.
        unsafe { self.read_multi_page(block, page, count, buffer)? };
        self.finish_blocking_read()
    }

    fn finish_blocking_read(&mut self) -> Result<(), SdError> {
        let result = self.wait_for_idle();
        if result.is_err() {
            // Stop the DMA engine before the buffer goes back to the caller.
            self.abort_data_read();
        }
        result
    }

    /// Advance the running transfer and report where it stands.
    pub fn query_status(&mut self) -> DeviceStatus {
        if self.status != DeviceStatus::ReadInProgress {
            return self.status;
        }

        let status = self.int_status();
        let errors = status & (IntStatus::COMMAND_ERRORS | IntStatus::DATA_ERRORS);
        if !errors.is_empty() {
            self.status = if errors == IntStatus::DATA_TIMEOUT_ERR {
                DeviceStatus::DataTimeout
            } else {
                DeviceStatus::CrcFailure
            };
            error!("read failed, int status {:#x}", status.bits());
            if let Err(err) = self.recover(true) {
                warn!("recovery after read error failed: {}", err);
            }
        } else if status.contains(IntStatus::DMA_INTERRUPT) {
            // The SDMA engine stops at each buffer boundary until the
            // address is written again.
            self.clear_int_status(IntStatus::DMA_INTERRUPT);
            let address = self.read::<SystemAddress>();
            self.write(address);
        } else if status.contains(IntStatus::XFER_COMPLETE) {
            self.status = DeviceStatus::Idle;
            self.clear_int_status(status);
            let checked = self
                .send_status()
                .and_then(|_| self.verify_response(MMC_READ_SINGLE_BLOCK, VerifyPhase::AfterExecution));
            if let Err(err) = checked {
                error!("read completed with error: {}", err);
                self.status = DeviceStatus::ReadFailure;
            }
        } else if self.platform.elapsed_us(self.read_start_us) > self.read_timeout_us {
            error!("read timed out after {}us", self.read_timeout_us);
            self.status = DeviceStatus::ReadFailure;
        }

        self.status
    }

    /// Poll until the running transfer finishes.
    pub fn wait_for_idle(&mut self) -> Result<(), SdError> {
        let mut status = self.query_status();
        while status == DeviceStatus::ReadInProgress {
            status = self.query_status();
        }
        match status {
            DeviceStatus::Idle => Ok(()),
            failed => Err(SdError::ReadFailed(failed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emmc::sim::{page_pattern, MockPlatform, MockRegs, SimCard};
    use crate::err::ProtocolError;
    use crate::BootConfig;

    const PAGE: usize = 512;

    fn ready_host(card: &SimCard) -> EMmcHost<MockRegs, MockPlatform> {
        let (regs, platform) = card.clone().split();
        let mut host = EMmcHost::new(regs, platform, BootConfig::default());
        host.init().unwrap();
        host
    }

    #[test]
    fn blocks_map_across_boot_partitions() {
        let size = 4 << 20;
        assert_eq!(translate_block(0, size, 12), (AccessRegion::BootPartition1, 0));
        assert_eq!(translate_block(1023, size, 12), (AccessRegion::BootPartition1, 1023));
        assert_eq!(translate_block(1024, size, 12), (AccessRegion::BootPartition2, 0));
        assert_eq!(translate_block(2047, size, 12), (AccessRegion::BootPartition2, 1023));
        assert_eq!(translate_block(2048, size, 12), (AccessRegion::UserArea, 0));
        assert_eq!(translate_block(5000, size, 12), (AccessRegion::UserArea, 2952));
        assert_eq!(translate_block(5000, 0, 12), (AccessRegion::UserArea, 5000));
    }

    #[test]
    fn single_page_from_user_area() {
        let card = SimCard::new();
        let mut host = ready_host(&card);
        let mut buf = [0u8; PAGE];

        host.read_page_blocking(2049, 3, &mut buf).unwrap();

        assert_eq!(host.current_region(), Some(AccessRegion::UserArea));
        assert_eq!(host.query_status(), DeviceStatus::Idle);
        let state = card.state();
        assert_eq!(state.ext_csd[EXT_CSD_PARTITION_CONFIG] & 0x7, 0);
        // Block 1 of the user area, page 3, sector addressed.
        assert_eq!(state.last_arg(MMC_READ_SINGLE_BLOCK), Some(11));
        assert!(buf.iter().all(|&b| b == page_pattern(11, 0)));
    }

    #[test]
    fn same_region_needs_no_switch() {
        let card = SimCard::new();
        let mut host = ready_host(&card);
        let mut buf = [0u8; PAGE];
        let switches = card.state().commands_issued(MMC_SWITCH);

        host.read_page_blocking(1, 0, &mut buf).unwrap();
        assert_eq!(host.current_region(), Some(AccessRegion::BootPartition1));
        assert_eq!(card.state().commands_issued(MMC_SWITCH), switches);

        host.read_page_blocking(1024, 0, &mut buf).unwrap();
        assert_eq!(host.current_region(), Some(AccessRegion::BootPartition2));
        assert_eq!(card.state().commands_issued(MMC_SWITCH), switches + 1);
        assert_eq!(card.state().last_arg(MMC_READ_SINGLE_BLOCK), Some(0));
    }

    #[test]
    fn byte_addressed_card() {
        let card = SimCard::new();
        card.state().ocr = 0x00FF_8080;
        let mut host = ready_host(&card);
        let mut buf = [0u8; PAGE];

        host.read_page_blocking(2049, 3, &mut buf).unwrap();
        assert_eq!(card.state().last_arg(MMC_READ_SINGLE_BLOCK), Some(11 << 9));
    }

    #[test]
    fn multi_page_sets_block_count_first() {
        let card = SimCard::new();
        let mut host = ready_host(&card);
        let mut buf = [0u8; 4 * PAGE];

        host.read_multi_page_blocking(2048, 0, 4, &mut buf).unwrap();

        let state = card.state();
        let tail: Vec<u8> = state.log.iter().rev().take(3).map(|c| c.0).collect();
        assert_eq!(tail, [MMC_SEND_STATUS, MMC_READ_MULTIPLE_BLOCK, MMC_SET_BLOCK_COUNT]);
        assert_eq!(state.last_arg(MMC_SET_BLOCK_COUNT), Some(4));
        assert_eq!(buf[3 * PAGE], page_pattern(0, 3));
    }

    #[test]
    fn bad_parameters_are_rejected_before_the_bus() {
        let card = SimCard::new();
        let mut host = ready_host(&card);
        let issued = card.state().log.len();
        let mut small = [0u8; PAGE];

        assert_eq!(host.read_page_blocking(0, 8, &mut small), Err(SdError::BadParameter));
        assert_eq!(host.read_multi_page_blocking(0, 0, 0, &mut small), Err(SdError::BadParameter));
        assert_eq!(host.read_multi_page_blocking(0, 0, 2, &mut small), Err(SdError::BadParameter));
        assert_eq!(host.read_page_blocking(0, 0, &mut small[..100]), Err(SdError::BadParameter));
        assert_eq!(card.state().log.len(), issued);
    }

    #[test]
    fn page_count_must_fit_the_block_count_field() {
        let card = SimCard::new();
        let mut host = ready_host(&card);
        let issued = card.state().log.len();
        let mut buf = vec![0u8; 65536 * PAGE];

        assert_eq!(
            host.read_multi_page_blocking(2048, 0, 65536, &mut buf),
            Err(SdError::BadParameter)
        );
        assert_eq!(card.state().log.len(), issued);
        assert_eq!(card.state().last_arg(MMC_SET_BLOCK_COUNT), None);
        assert_eq!(host.check_read(0, u16::MAX as u32, &buf), Ok(()));
    }

    #[test]
    fn failed_block_count_command_aborts_the_data_line() {
        let card = SimCard::new();
        let mut host = ready_host(&card);
        {
            let mut state = card.state();
            state.fail_commands = EMMC_COMMAND_RETRIES;
            state.fail_only = Some(MMC_SET_BLOCK_COUNT);
            state.inject = IntStatus::COMMAND_CRC_ERR.bits();
            state.resets.clear();
        }
        let mut buf = [0u8; 2 * PAGE];

        assert!(unsafe { host.read_multi_page(2048, 0, 2, &mut buf) }
            .unwrap_err()
            .is_protocol());
        let state = card.state();
        assert_eq!(state.resets.last(), Some(&"dat"));
        assert_eq!(state.commands_issued(MMC_READ_MULTIPLE_BLOCK), 0);
        drop(state);
        assert_eq!(host.query_status(), DeviceStatus::Idle);
    }

    #[test]
    fn failed_read_command_aborts_the_data_line() {
        let card = SimCard::new();
        let mut host = ready_host(&card);
        {
            let mut state = card.state();
            state.fail_commands = EMMC_COMMAND_RETRIES;
            state.fail_only = Some(MMC_READ_SINGLE_BLOCK);
            state.inject = IntStatus::COMMAND_CRC_ERR.bits();
            state.resets.clear();
        }
        let mut buf = [0u8; PAGE];

        assert!(unsafe { host.read_page(2048, 0, &mut buf) }
            .unwrap_err()
            .is_protocol());
        assert_eq!(card.state().resets.last(), Some(&"dat"));
        assert_eq!(host.query_status(), DeviceStatus::Idle);
    }

    #[test]
    fn rejected_address_aborts_the_data_line() {
        let card = SimCard::new();
        let mut host = ready_host(&card);
        card.state().read_status = CardStatus::ADDRESS_OUT_OF_RANGE.bits();
        card.state().resets.clear();
        let mut buf = [0u8; PAGE];

        let err = unsafe { host.read_page(2048, 0, &mut buf) }.unwrap_err();
        assert_eq!(
            err,
            SdError::Protocol(ProtocolError::CardStatus(
                CardStatus::ADDRESS_OUT_OF_RANGE.bits(),
                "READ_SINGLE_BLOCK"
            ))
        );
        assert_eq!(card.state().resets, ["dat"]);
        assert_eq!(host.query_status(), DeviceStatus::Idle);
    }

    #[test]
    fn dma_boundaries_are_resumed() {
        let card = SimCard::new();
        let mut host = ready_host(&card);
        card.state().dma_boundaries = 2;
        let mut buf = [0u8; 2 * PAGE];

        unsafe { host.read_multi_page(2048, 0, 2, &mut buf) }.unwrap();
        assert_eq!(host.query_status(), DeviceStatus::ReadInProgress);
        assert_eq!(host.query_status(), DeviceStatus::ReadInProgress);
        assert_eq!(host.wait_for_idle(), Ok(()));
        assert_eq!(card.state().dma_resumes, 2);
    }

    #[test]
    fn data_timeout_is_reported_and_recovered() {
        let card = SimCard::new();
        let mut host = ready_host(&card);
        card.state().data_error = IntStatus::DATA_TIMEOUT_ERR.bits();
        card.state().resets.clear();
        let mut buf = [0u8; PAGE];

        unsafe { host.read_page(2048, 0, &mut buf) }.unwrap();
        assert_eq!(host.query_status(), DeviceStatus::DataTimeout);
        assert_eq!(host.wait_for_idle(), Err(SdError::ReadFailed(DeviceStatus::DataTimeout)));

        let state = card.state();
        assert!(state.resets.contains(&"dat"));
        assert_eq!(state.log.last().map(|c| c.0), Some(MMC_STOP_TRANSMISSION));
    }

    #[test]
    fn data_crc_error() {
        let card = SimCard::new();
        let mut host = ready_host(&card);
        card.state().data_error = IntStatus::DATA_CRC_ERR.bits();
        let mut buf = [0u8; PAGE];

        assert_eq!(
            host.read_page_blocking(2048, 0, &mut buf),
            Err(SdError::ReadFailed(DeviceStatus::CrcFailure))
        );
    }

    #[test]
    fn ecc_failure_after_transfer() {
        let card = SimCard::new();
        let mut host = ready_host(&card);
        card.state().after_read_status = CardStatus::CARD_ECC_FAILED.bits();
        let mut buf = [0u8; PAGE];

        assert_eq!(
            host.read_page_blocking(2048, 0, &mut buf),
            Err(SdError::ReadFailed(DeviceStatus::ReadFailure))
        );
    }

    #[test]
    fn stalled_transfer_times_out() {
        let card = SimCard::new();
        let mut host = ready_host(&card);
        card.state().data_stall = true;
        let mut buf = [0u8; PAGE];

        unsafe { host.read_page(2048, 0, &mut buf) }.unwrap();
        assert_eq!(host.wait_for_idle(), Err(SdError::ReadFailed(DeviceStatus::ReadFailure)));
    }
}
