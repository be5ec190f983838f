#![allow(unused)]

use bitflags::bitflags;

// Command indices
pub const MMC_GO_IDLE_STATE: u8 = 0;
pub const MMC_SEND_OP_COND: u8 = 1;
pub const MMC_ALL_SEND_CID: u8 = 2;
pub const MMC_SET_RELATIVE_ADDR: u8 = 3;
pub const MMC_SWITCH: u8 = 6;
pub const MMC_SELECT_CARD: u8 = 7;
pub const MMC_SEND_EXT_CSD: u8 = 8;
pub const MMC_SEND_CSD: u8 = 9;
pub const MMC_STOP_TRANSMISSION: u8 = 12;
pub const MMC_SEND_STATUS: u8 = 13;
pub const MMC_SET_BLOCKLEN: u8 = 16;
pub const MMC_READ_SINGLE_BLOCK: u8 = 17;
pub const MMC_READ_MULTIPLE_BLOCK: u8 = 18;
pub const MMC_SET_BLOCK_COUNT: u8 = 23;

// CMD_XFER_MODE field values
pub const RESP_TYPE_NO_RESPONSE: u32 = 0;
pub const RESP_TYPE_136: u32 = 1;
pub const RESP_TYPE_48: u32 = 2;
pub const RESP_TYPE_48_BUSY: u32 = 3;
pub const COMMAND_TYPE_NORMAL: u32 = 0;
pub const COMMAND_TYPE_ABORT: u32 = 3;

// BLOCK_SIZE_BLOCK_COUNT: pause the SDMA engine every 512 KiB
pub const HOST_DMA_BUFFER_SIZE_DMA512K: u32 = 7;

// POWER_CONTROL_HOST bus voltage encodings
pub const SD_BUS_VOLTAGE_V1_8: u32 = 5;
pub const SD_BUS_VOLTAGE_V3_0: u32 = 6;
pub const SD_BUS_VOLTAGE_V3_3: u32 = 7;

// CLOCK_CONTROL SDCLK divider used while the controller comes out of reset
pub const SDCLK_FREQUENCY_DIV64: u32 = 0x20;
pub const DATA_TIMEOUT_COUNTER_MAX: u32 = 0xE;
// Timeout counter n selects 2^(13 + n) controller cycles
pub const DATA_TIMEOUT_COUNTER_BASE_LOG2: u32 = 13;

// PRESENT_STATE: all four DAT lines high
pub const DAT_3_0_LINES_IDLE: u32 = 0xF;

// HOST_CONTROL2 UHS mode
pub const UHS_MODE_DDR50: u32 = 4;

// Relative card address assigned by the driver
pub const EMMC_RCA: u32 = 2 << 16;

// OCR
pub const EMMC_OCR_QUERY_VOLTAGE: u32 = 0x0000_0000;
pub const EMMC_OCR_HIGH_VOLTAGE: u32 = 0x00FF_8000;
pub const EMMC_OCR_DUAL_VOLTAGE: u32 = 0x00FF_8080;
pub const EMMC_OCR_LOW_VOLTAGE: u32 = 0x0000_0080;
pub const EMMC_OCR_HIGH_VOLTAGE_MASK: u32 = 0x00FF_8000;
pub const EMMC_OCR_LOW_VOLTAGE_MASK: u32 = 0x0000_0080;
pub const EMMC_OCR_SECTOR_MODE: u32 = 1 << 30;
pub const EMMC_OCR_READY: u32 = 1 << 31;

// CSD
pub const CSD_TRAN_SPEED_V43: u32 = 0x32;
pub const CSD_MAX_C_SIZE: u32 = 0xFFF;
pub const CSD_MAX_C_SIZE_MULT: u32 = 0x7;
pub const CSD_SPEC_VERS_4: u32 = 4;
pub const EMMC_MAX_PAGE_SIZE_LOG2: u32 = 9;
pub const EMMC_BLOCK_SIZE_LOG2: u32 = 12;
pub const EMMC_TRAN_SPEED_DEFAULT_MHZ: u32 = 20;
pub const EMMC_TRAN_SPEED_V43_MHZ: u32 = 25;
pub const EMMC_MAX_CLOCK_MHZ: u32 = 52;

// EXT_CSD byte offsets
pub const EXT_CSD_PARTITION_CONFIG: usize = 179;
pub const EXT_CSD_BUS_WIDTH: usize = 183;
pub const EXT_CSD_HS_TIMING: usize = 185;
pub const EXT_CSD_POWER_CLASS: usize = 187;
pub const EXT_CSD_CARD_TYPE: usize = 196;
pub const EXT_CSD_PWR_CL_52_195: usize = 200;
pub const EXT_CSD_PWR_CL_26_195: usize = 201;
pub const EXT_CSD_PWR_CL_52_360: usize = 202;
pub const EXT_CSD_PWR_CL_26_360: usize = 203;
pub const EXT_CSD_SEC_COUNT: usize = 212;
pub const EXT_CSD_BOOT_SIZE_MULT: usize = 226;
pub const EXT_CSD_PWR_CL_DDR_52_195: usize = 238;
pub const EXT_CSD_PWR_CL_DDR_52_360: usize = 239;
pub const EXT_CSD_SIZE: usize = 512;

// BOOT_SIZE_MULT is in units of 128 KiB
pub const EXT_CSD_BOOT_SIZE_SHIFT: u32 = 17;

// CARD_TYPE
pub const EXT_CSD_CARD_TYPE_HS_26: u8 = 1 << 0;
pub const EXT_CSD_CARD_TYPE_HS_52: u8 = 1 << 1;
pub const EXT_CSD_CARD_TYPE_DDR_52_180_300: u8 = 1 << 2;
pub const EXT_CSD_CARD_TYPE_DDR_52_120: u8 = 1 << 3;

// SWITCH arguments: access mode write-byte (0x03), index in 23:16, value in 15:8
pub const EMMC_SWITCH_WRITE_BYTE: u32 = 0x0300_0000;
pub const EMMC_SWITCH_BUS_WIDTH_ARG: u32 = 0x03B7_0000;
pub const EMMC_SWITCH_HIGH_SPEED_ARG: u32 = 0x03B9_0100;
pub const EMMC_SWITCH_POWER_CLASS_ARG: u32 = 0x03BB_0000;
pub const EMMC_SWITCH_PARTITION_ARG: u32 = 0x03B3_0000;
pub const EMMC_PARTITION_ACCESS_MASK: u32 = 0x7;
pub const EMMC_BOOT_PARTITION_ENABLE_SHIFT: u32 = 3;

// Timing budgets, in microseconds
pub const EMMC_COMMAND_TIMEOUT_US: u32 = 100_000;
pub const EMMC_POLL_TIMEOUT_US: u32 = 100_000;
pub const EMMC_OP_COND_TIMEOUT_US: u32 = 1_000_000;
pub const EMMC_OP_COND_RETRY_DELAY_US: u32 = 10_000;
pub const EMMC_READ_TIMEOUT_MIN_US: u32 = 200_000;
pub const EMMC_READ_TIMEOUT_MAX_US: u32 = 800_000;
pub const EMMC_READ_TIMEOUT_MARGIN_US: u32 = 50_000;
pub const EMMC_RECOVERY_SETTLE_US: u32 = 40;

pub const EMMC_COMMAND_RETRIES: u32 = 3;
pub const EMMC_ABORT_RETRIES: u32 = 2;

bitflags! {
    /// R1 card status word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CardStatus: u32 {
        const ADDRESS_OUT_OF_RANGE = 1 << 31;
        const ADDRESS_MISALIGN = 1 << 30;
        const BLOCK_LEN_ERROR = 1 << 29;
        const COM_CRC_ERROR = 1 << 23;
        const ILLEGAL_COMMAND = 1 << 22;
        const CARD_ECC_FAILED = 1 << 21;
        const CC_ERROR = 1 << 20;
        const READY_FOR_DATA = 1 << 8;
        const SWITCH_ERROR = 1 << 7;
    }
}

impl CardStatus {
    pub const STATE_SHIFT: u32 = 9;
    pub const STATE_MASK: u32 = 0xF;

    pub fn state(raw: u32) -> CardState {
        CardState::from_raw((raw >> Self::STATE_SHIFT) & Self::STATE_MASK)
    }
}

/// Card state field (bits 12:9) of the R1 status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardState {
    Idle,
    Ready,
    Ident,
    Stby,
    Tran,
    Data,
    Rcv,
    Prg,
    Dis,
    Reserved(u32),
}

impl CardState {
    pub fn from_raw(value: u32) -> Self {
        match value {
            0 => CardState::Idle,
            1 => CardState::Ready,
            2 => CardState::Ident,
            3 => CardState::Stby,
            4 => CardState::Tran,
            5 => CardState::Data,
            6 => CardState::Rcv,
            7 => CardState::Prg,
            8 => CardState::Dis,
            other => CardState::Reserved(other),
        }
    }
}
