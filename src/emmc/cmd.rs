use log::{debug, warn};

use crate::err::{ProtocolError, SdError};
use crate::platform::Platform;

use super::regs::{
    Argument, CmdXferMode, IntStatus, PresentState, RegisterIo, RESPONSE_R0_R1, RESPONSE_R2_R3,
    RESPONSE_R4_R5, RESPONSE_R6_R7,
};
use super::{EMmcHost, constant::*};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    None,
    R1,
    R1b,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
}

impl ResponseType {
    /// R2 carries the CID/CSD in place of the index; R3/R4 have neither
    /// index nor CRC.
    pub fn index_check(self) -> bool {
        !matches!(self, ResponseType::None | ResponseType::R2 | ResponseType::R3 | ResponseType::R4)
    }

    pub fn crc_check(self) -> bool {
        !matches!(self, ResponseType::None | ResponseType::R3 | ResponseType::R4)
    }

    pub fn length_select(self) -> u32 {
        match self {
            ResponseType::None => RESP_TYPE_NO_RESPONSE,
            ResponseType::R2 => RESP_TYPE_136,
            ResponseType::R1b => RESP_TYPE_48_BUSY,
            _ => RESP_TYPE_48,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EMmcCommand {
    pub opcode: u8,
    pub arg: u32,
    pub resp_type: ResponseType,
    pub data_present: bool,
    pub command_type: u32,
}

impl EMmcCommand {
    pub fn new(opcode: u8, arg: u32, resp_type: ResponseType) -> Self {
        Self {
            opcode,
            arg,
            resp_type,
            data_present: false,
            command_type: COMMAND_TYPE_NORMAL,
        }
    }

    /// Mark as a read that moves data over DMA.
    pub fn with_data(mut self) -> Self {
        self.data_present = true;
        self
    }

    /// STOP_TRANSMISSION flagged as an abort.
    pub fn abort() -> Self {
        Self {
            command_type: COMMAND_TYPE_ABORT,
            ..Self::new(MMC_STOP_TRANSMISSION, 0, ResponseType::R1b)
        }
    }

    /// The CMD_XFER_MODE word that issues this command.
    pub fn xfer_mode(&self) -> CmdXferMode {
        let data = self.data_present as u32;
        CmdXferMode(0)
            .set_command_index(self.opcode as u32)
            .set_command_type(self.command_type)
            .set_data_present_select(data)
            .set_data_xfer_dir_sel(data)
            .set_block_count_en(data)
            .set_dma_en(data)
            .set_multi_block_select((self.opcode == MMC_READ_MULTIPLE_BLOCK) as u32)
            .set_cmd_index_check_en(self.resp_type.index_check() as u32)
            .set_cmd_crc_check_en(self.resp_type.crc_check() as u32)
            .set_resp_type_select(self.resp_type.length_select())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SdResponse {
    pub raw: [u32; 4],
}

impl SdResponse {
    pub fn new() -> Self {
        Self { raw: [0; 4] }
    }

    pub fn as_r1(&self) -> u32 {
        self.raw[0]
    }

    pub fn as_r2(&self) -> [u32; 4] {
        self.raw
    }

    pub fn as_r3(&self) -> u32 {
        self.raw[0]
    }
}

/// When a response is checked relative to the command's execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyPhase {
    /// The R1 returned with the command.
    Response,
    /// A CMD13 status read after the command completed.
    AfterExecution,
}

/// Error bits of an R1 status word that matter for `opcode` at `phase`.
pub fn response_errors(opcode: u8, phase: VerifyPhase, status: u32) -> CardStatus {
    let status = CardStatus::from_bits_truncate(status);
    let relevant = match (opcode, phase) {
        (MMC_READ_SINGLE_BLOCK | MMC_READ_MULTIPLE_BLOCK, VerifyPhase::Response) => {
            CardStatus::ADDRESS_OUT_OF_RANGE
                | CardStatus::ADDRESS_MISALIGN
                | CardStatus::BLOCK_LEN_ERROR
                | CardStatus::CC_ERROR
        }
        (MMC_READ_SINGLE_BLOCK | MMC_READ_MULTIPLE_BLOCK, VerifyPhase::AfterExecution) => {
            CardStatus::COM_CRC_ERROR | CardStatus::ILLEGAL_COMMAND | CardStatus::CARD_ECC_FAILED
        }
        (MMC_SET_BLOCKLEN, VerifyPhase::Response) => CardStatus::BLOCK_LEN_ERROR | CardStatus::CC_ERROR,
        (MMC_SWITCH, VerifyPhase::AfterExecution) => CardStatus::SWITCH_ERROR | CardStatus::COM_CRC_ERROR,
        (MMC_SEND_EXT_CSD, VerifyPhase::Response) => CardStatus::CC_ERROR,
        _ => CardStatus::empty(),
    };
    status & relevant
}

fn command_name(opcode: u8) -> &'static str {
    match opcode {
        MMC_READ_SINGLE_BLOCK => "READ_SINGLE_BLOCK",
        MMC_READ_MULTIPLE_BLOCK => "READ_MULTIPLE_BLOCK",
        MMC_SET_BLOCKLEN => "SET_BLOCKLEN",
        MMC_SWITCH => "SWITCH",
        MMC_SEND_EXT_CSD => "SEND_EXT_CSD",
        _ => "command",
    }
}

impl<R: RegisterIo, P: Platform> EMmcHost<R, P> {
    /// Issue one command and collect its response.
    pub fn send_command(&mut self, cmd: &EMmcCommand) -> Result<SdResponse, SdError> {
        debug!(
            "CMD{} arg={:#x} resp={:?} data={}",
            cmd.opcode, cmd.arg, cmd.resp_type, cmd.data_present
        );

        self.wait_cmd_inhibit_cmd()?;

        let xfer = cmd.xfer_mode();
        let mut result = Err(SdError::Timeout);
        for attempt in 0..EMMC_COMMAND_RETRIES {
            self.issue(cmd.arg, xfer);
            result = self.wait_command_complete();
            match result {
                Ok(()) => break,
                Err(err) => {
                    warn!("CMD{} attempt {} failed: {}", cmd.opcode, attempt + 1, err);
                    if let Err(SdError::NotInitialized) = self.recover(cmd.data_present) {
                        return Err(SdError::NotInitialized);
                    }
                }
            }
        }
        result?;

        // Silicon quirk: the response registers are not valid immediately
        // after CMD_COMPLETE on these revisions.
        self.platform.wait_us(self.family.post_command_settle_us());

        self.wait_cmd_inhibit_cmd()?;
        if cmd.resp_type == ResponseType::R1b {
            self.wait_cmd_inhibit_dat()?;
        }

        let response = self.read_response(cmd.resp_type);
        self.response = response.raw;
        debug!("CMD{} response {:#x?}", cmd.opcode, response.raw);
        Ok(response)
    }

    /// Clear stale status, then write the argument and the command word.
    pub(crate) fn issue(&self, arg: u32, xfer: CmdXferMode) {
        let pending = self.int_status();
        self.clear_int_status(pending);
        self.write(Argument(arg));
        self.write(xfer);
    }

    pub(crate) fn wait_command_complete(&self) -> Result<(), SdError> {
        let start = self.platform.now_us();
        loop {
            let status = self.int_status();
            let errors = status & IntStatus::COMMAND_ERRORS;
            if errors == IntStatus::COMMAND_TIMEOUT_ERR {
                return Err(SdError::Timeout);
            }
            if !errors.is_empty() {
                return Err(ProtocolError::Command(errors.bits()).into());
            }
            if status.contains(IntStatus::CMD_COMPLETE) {
                return Ok(());
            }
            if self.platform.elapsed_us(start) > EMMC_COMMAND_TIMEOUT_US {
                return Err(SdError::Timeout);
            }
        }
    }

    pub(crate) fn wait_cmd_inhibit_cmd(&self) -> Result<(), SdError> {
        self.wait_for(EMMC_POLL_TIMEOUT_US, |host| {
            host.read::<PresentState>().cmd_inhibit_cmd() == 0
        })
    }

    /// Wait for the card to release DAT0 after a busy response.
    pub(crate) fn wait_cmd_inhibit_dat(&self) -> Result<(), SdError> {
        self.wait_for(self.read_timeout_us, |host| {
            host.read::<PresentState>().cmd_inhibit_dat() == 0
        })
    }

    pub(crate) fn read_response(&self, resp_type: ResponseType) -> SdResponse {
        let mut response = SdResponse::new();
        match resp_type {
            ResponseType::None => {}
            ResponseType::R2 => {
                response.raw = [
                    self.regs.read32(RESPONSE_R0_R1),
                    self.regs.read32(RESPONSE_R2_R3),
                    self.regs.read32(RESPONSE_R4_R5),
                    self.regs.read32(RESPONSE_R6_R7),
                ];
            }
            _ => response.raw[0] = self.regs.read32(RESPONSE_R0_R1),
        }
        response
    }

    /// Check the last R1 status for errors relevant to `opcode`.
    pub fn verify_response(&self, opcode: u8, phase: VerifyPhase) -> Result<(), SdError> {
        let errors = response_errors(opcode, phase, self.response[0]);
        if errors.is_empty() {
            Ok(())
        } else {
            warn!("{} failed, card status {:#x}", command_name(opcode), self.response[0]);
            Err(ProtocolError::CardStatus(errors.bits(), command_name(opcode)).into())
        }
    }

    pub(crate) fn send_status(&mut self) -> Result<u32, SdError> {
        let cmd = EMmcCommand::new(MMC_SEND_STATUS, self.rca, ResponseType::R1);
        Ok(self.send_command(&cmd)?.as_r1())
    }

    /// SWITCH, then confirm through SEND_STATUS that the card took it.
    pub fn send_switch(&mut self, arg: u32) -> Result<(), SdError> {
        self.send_command(&EMmcCommand::new(MMC_SWITCH, arg, ResponseType::R1b))?;
        self.send_status()?;
        self.verify_response(MMC_SWITCH, VerifyPhase::AfterExecution)
    }
}
