//! A register-level model of a controller with one eMMC part attached, for
//! unit tests. Commands execute synchronously when CMD_XFER_MODE is written.

use std::cell::{RefCell, RefMut};
use std::collections::BTreeMap;
use std::rc::Rc;

use super::constant::*;
use super::regs::*;
use crate::platform::{ClockReset, Platform, Timer};

const CID: [u32; 4] = [0x3456_7812, 0x4D43_1012, 0x5349_4D4D, 0x0015_0100];
// Spec v4, TAAC 0x26, TRAN_SPEED 0x32, capacity deferred to EXT_CSD.
const CSD: [u32; 4] = [0x0000_0000, 0xFFC0_0380, 0x325F_5A83, 0x0090_2600];
const DMA_TOKEN: u32 = 0x8000_0000;

/// Byte the model writes at every position of page `page` of a read at `arg`.
pub fn page_pattern(arg: u32, page: usize) -> u8 {
    (arg as usize).wrapping_add(page) as u8
}

pub struct SimState {
    pub regs: BTreeMap<u32, u32>,
    pub int_status: u32,
    pub response: [u32; 4],

    pub cid: [u32; 4],
    pub csd: [u32; 4],
    pub ext_csd: [u8; EXT_CSD_SIZE],
    pub ocr: u32,
    /// SEND_OP_COND attempts answered busy before the card is ready.
    pub ready_after: u32,
    op_cond_tries: u32,
    pub card_state: u32,
    pub inserted: bool,

    /// Commands that fail with `inject` instead of completing.
    pub fail_commands: u32,
    pub inject: u32,
    /// Restrict `fail_commands` to one opcode.
    pub fail_only: Option<u8>,
    pub switch_error: bool,
    pub clock_never_stable: bool,
    pub hs_timing_sticks: bool,
    pub ddr50_host: bool,

    pub resets: Vec<&'static str>,
    pub dat_level: u32,
    pub dat_released_by_reset: bool,

    /// R1 bits returned with READ_SINGLE/READ_MULTIPLE.
    pub read_status: u32,
    /// R1 bits returned with every SEND_STATUS.
    pub after_read_status: u32,
    /// Interrupt status raised in place of transfer complete.
    pub data_error: u32,
    pub data_stall: bool,
    pub dma_boundaries: u32,
    pending_boundaries: u32,
    pub dma_resumes: u32,
    dma: Option<(*mut u8, usize)>,

    /// `(opcode, argument)` of every command issued.
    pub log: Vec<(u8, u32)>,
    /// `(4-bit, 8-bit, block count)` at each SEND_EXT_CSD.
    pub ext_csd_reads: Vec<(u32, u32, u32)>,
    pub source_divider_at_first_ext_csd: Option<u32>,

    now: u32,
    source_divider: Option<u32>,
    pub reset_asserted: bool,
    pub clock_enabled: bool,
}

impl SimState {
    fn new() -> Self {
        let mut ext_csd = [0u8; EXT_CSD_SIZE];
        ext_csd[EXT_CSD_SEC_COUNT..EXT_CSD_SEC_COUNT + 4].copy_from_slice(&0x0074_0000u32.to_le_bytes());
        ext_csd[EXT_CSD_CARD_TYPE] =
            EXT_CSD_CARD_TYPE_HS_26 | EXT_CSD_CARD_TYPE_HS_52 | EXT_CSD_CARD_TYPE_DDR_52_180_300;
        // 4 MiB boot partitions, boot partition 1 enabled.
        ext_csd[EXT_CSD_BOOT_SIZE_MULT] = 32;
        ext_csd[EXT_CSD_PARTITION_CONFIG] = 1 << EMMC_BOOT_PARTITION_ENABLE_SHIFT;

        Self {
            regs: BTreeMap::new(),
            int_status: 0,
            response: [0; 4],
            cid: CID,
            csd: CSD,
            ext_csd,
            ocr: 0x40FF_8080,
            ready_after: 1,
            op_cond_tries: 0,
            card_state: 4,
            inserted: true,
            fail_commands: 0,
            inject: 0,
            fail_only: None,
            switch_error: false,
            clock_never_stable: false,
            hs_timing_sticks: true,
            ddr50_host: false,
            resets: Vec::new(),
            dat_level: DAT_3_0_LINES_IDLE,
            dat_released_by_reset: false,
            read_status: 0,
            after_read_status: 0,
            data_error: 0,
            data_stall: false,
            dma_boundaries: 0,
            pending_boundaries: 0,
            dma_resumes: 0,
            dma: None,
            log: Vec::new(),
            ext_csd_reads: Vec::new(),
            source_divider_at_first_ext_csd: None,
            now: 0,
            source_divider: None,
            reset_asserted: false,
            clock_enabled: false,
        }
    }

    pub fn commands_issued(&self, opcode: u8) -> usize {
        self.log.iter().filter(|c| c.0 == opcode).count()
    }

    pub fn last_arg(&self, opcode: u8) -> Option<u32> {
        self.log.iter().rev().find(|c| c.0 == opcode).map(|c| c.1)
    }

    fn reg(&self, offset: u32) -> u32 {
        self.regs.get(&offset).copied().unwrap_or(0)
    }

    fn r1(&self) -> u32 {
        (self.card_state << CardStatus::STATE_SHIFT) | CardStatus::READY_FOR_DATA.bits()
    }

    fn read(&self, offset: u32) -> u32 {
        match offset {
            INTERRUPT_STATUS => self.int_status,
            RESPONSE_R0_R1 => self.response[0],
            RESPONSE_R2_R3 => self.response[1],
            RESPONSE_R4_R5 => self.response[2],
            RESPONSE_R6_R7 => self.response[3],
            PresentState::OFFSET => PresentState(0)
                .set_card_inserted(self.inserted as u32)
                .set_card_state_stable(1)
                .set_dat_3_0_line_level(self.dat_level)
                .0,
            Capabilities::OFFSET => Capabilities(0)
                .set_high_speed_support(1)
                .set_voltage_support_3v3(1)
                .set_voltage_support_1v8(1)
                .0,
            CapabilitiesHigher::OFFSET => CapabilitiesHigher(0).set_ddr50(self.ddr50_host as u32).0,
            ClockControl::OFFSET => {
                ClockControl(self.reg(offset))
                    .set_internal_clock_stable(!self.clock_never_stable as u32)
                    .0
            }
            _ => self.reg(offset),
        }
    }

    fn write(&mut self, offset: u32, value: u32) {
        match offset {
            INTERRUPT_STATUS => self.int_status &= !value,
            ClockControl::OFFSET => {
                let reg = ClockControl(value);
                if reg.sw_reset_for_all() != 0 {
                    self.resets.push("all");
                    self.int_status = 0;
                    if self.dat_released_by_reset {
                        self.dat_level = DAT_3_0_LINES_IDLE;
                    }
                }
                if reg.sw_reset_for_cmd_line() != 0 {
                    self.resets.push("cmd");
                }
                if reg.sw_reset_for_dat_line() != 0 {
                    self.resets.push("dat");
                }
                // Resets complete immediately.
                let settled = reg
                    .set_sw_reset_for_all(0)
                    .set_sw_reset_for_cmd_line(0)
                    .set_sw_reset_for_dat_line(0)
                    .set_internal_clock_stable(0);
                self.regs.insert(offset, settled.0);
            }
            SystemAddress::OFFSET => {
                self.regs.insert(offset, value);
                if self.pending_boundaries > 0 {
                    self.pending_boundaries -= 1;
                    self.dma_resumes += 1;
                    self.int_status |= if self.pending_boundaries == 0 {
                        IntStatus::XFER_COMPLETE.bits()
                    } else {
                        IntStatus::DMA_INTERRUPT.bits()
                    };
                }
            }
            CmdXferMode::OFFSET => {
                self.regs.insert(offset, value);
                self.execute(CmdXferMode(value));
            }
            _ => {
                self.regs.insert(offset, value);
            }
        }
    }

    fn execute(&mut self, xfer: CmdXferMode) {
        let opcode = xfer.command_index() as u8;
        let arg = self.reg(Argument::OFFSET);
        self.log.push((opcode, arg));

        if self.fail_commands > 0 && self.fail_only.is_none_or(|op| op == opcode) {
            self.fail_commands -= 1;
            self.int_status |= self.inject | IntStatus::ERR_INTERRUPT.bits();
            return;
        }
        self.int_status |= IntStatus::CMD_COMPLETE.bits();

        let r1 = self.r1();
        self.response = match opcode {
            MMC_GO_IDLE_STATE => [0; 4],
            MMC_SEND_OP_COND => {
                self.op_cond_tries += 1;
                let ready = if self.op_cond_tries > self.ready_after {
                    EMMC_OCR_READY
                } else {
                    0
                };
                [self.ocr | ready, 0, 0, 0]
            }
            MMC_ALL_SEND_CID => self.cid,
            MMC_SEND_CSD => self.csd,
            MMC_SWITCH => {
                let index = ((arg >> 16) & 0xFF) as usize;
                let value = (arg >> 8) as u8;
                if index != EXT_CSD_HS_TIMING || self.hs_timing_sticks {
                    self.ext_csd[index] = value;
                }
                [r1, 0, 0, 0]
            }
            MMC_SEND_EXT_CSD => {
                let host = PowerControlHost(self.reg(PowerControlHost::OFFSET));
                let blocks = BlockSizeBlockCount(self.reg(BlockSizeBlockCount::OFFSET));
                self.ext_csd_reads.push((
                    host.data_xfer_width(),
                    host.extended_data_transfer_width(),
                    blocks.blocks_count(),
                ));
                if self.source_divider_at_first_ext_csd.is_none() {
                    self.source_divider_at_first_ext_csd = self.source_divider;
                }
                let ext_csd = self.ext_csd;
                self.dma_fill(|buf| {
                    let len = buf.len().min(EXT_CSD_SIZE);
                    buf[..len].copy_from_slice(&ext_csd[..len]);
                });
                self.int_status |= IntStatus::XFER_COMPLETE.bits();
                [r1, 0, 0, 0]
            }
            MMC_SEND_STATUS => {
                let switch = if self.switch_error {
                    CardStatus::SWITCH_ERROR.bits()
                } else {
                    0
                };
                [r1 | switch | self.after_read_status, 0, 0, 0]
            }
            MMC_READ_SINGLE_BLOCK | MMC_READ_MULTIPLE_BLOCK => {
                if self.read_status == 0 {
                    self.data_phase(arg);
                }
                [r1 | self.read_status, 0, 0, 0]
            }
            _ => [r1, 0, 0, 0],
        };
    }

    fn data_phase(&mut self, arg: u32) {
        let blocks = BlockSizeBlockCount(self.reg(BlockSizeBlockCount::OFFSET));
        let page_size = blocks.xfer_block_size() as usize;
        let count = blocks.blocks_count() as usize;
        self.dma_fill(|buf| {
            let len = buf.len().min(page_size * count);
            for (i, byte) in buf[..len].iter_mut().enumerate() {
                *byte = page_pattern(arg, i / page_size);
            }
        });

        if self.data_error != 0 {
            self.int_status |= self.data_error | IntStatus::ERR_INTERRUPT.bits();
        } else if self.dma_boundaries > 0 {
            self.pending_boundaries = self.dma_boundaries;
            self.int_status |= IntStatus::DMA_INTERRUPT.bits();
        } else if !self.data_stall {
            self.int_status |= IntStatus::XFER_COMPLETE.bits();
        }
    }

    fn dma_fill(&mut self, fill: impl FnOnce(&mut [u8])) {
        if let Some((ptr, len)) = self.dma {
            assert_eq!(self.reg(SystemAddress::OFFSET), DMA_TOKEN);
            // SAFETY: the host registered this buffer for the transfer being
            // executed and keeps it borrowed until completion.
            fill(unsafe { core::slice::from_raw_parts_mut(ptr, len) });
        }
    }
}

#[derive(Clone)]
pub struct SimCard(Rc<RefCell<SimState>>);

impl SimCard {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(SimState::new())))
    }

    pub fn state(&self) -> RefMut<'_, SimState> {
        self.0.borrow_mut()
    }

    pub fn split(self) -> (MockRegs, MockPlatform) {
        (MockRegs(self.0.clone()), MockPlatform(self.0))
    }
}

pub struct MockRegs(Rc<RefCell<SimState>>);

impl RegisterIo for MockRegs {
    fn read32(&self, offset: u32) -> u32 {
        self.0.borrow().read(offset)
    }

    fn write32(&self, offset: u32, value: u32) {
        self.0.borrow_mut().write(offset, value)
    }
}

pub struct MockPlatform(Rc<RefCell<SimState>>);

impl MockPlatform {
    pub fn last_source_divider(&self) -> Option<u32> {
        self.0.borrow().source_divider
    }
}

impl Timer for MockPlatform {
    fn now_us(&self) -> u32 {
        let mut state = self.0.borrow_mut();
        state.now = state.now.wrapping_add(1);
        state.now
    }

    fn wait_us(&self, us: u32) {
        let mut state = self.0.borrow_mut();
        state.now = state.now.wrapping_add(us);
    }
}

impl ClockReset for MockPlatform {
    fn set_reset(&self, asserted: bool) {
        self.0.borrow_mut().reset_asserted = asserted;
    }

    fn set_clock_enable(&self, enabled: bool) {
        self.0.borrow_mut().clock_enabled = enabled;
    }

    fn set_source_divider(&self, field: u32) {
        self.0.borrow_mut().source_divider = Some(field);
    }
}

impl Platform for MockPlatform {
    fn dma_address(&self, buffer: &mut [u8]) -> u32 {
        self.0.borrow_mut().dma = Some((buffer.as_mut_ptr(), buffer.len()));
        DMA_TOKEN
    }

    fn chip_id(&self) -> u32 {
        super::soc::CHIP_ID_T124
    }
}
