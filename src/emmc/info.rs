//! Card-resident registers: CID, CSD and the extended CSD.
//!
//! Long responses arrive with the CRC byte stripped, so CSD/CID bit `n`
//! lives at bit `n - 8` of the four response words.

use super::constant::*;
use super::soc::SiliconFamily;

/// Card identification register.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Cid {
    pub manufacturer_id: u8,
    pub oem_id: u16,
    pub product_name: [u8; 6],
    pub product_revision: u8,
    pub serial_number: u32,
    pub manufacturing_date: u8,
}

impl Cid {
    pub fn parse(resp: &[u32; 4]) -> Self {
        let pnm = [
            (resp[2] >> 24) as u8,
            (resp[2] >> 16) as u8,
            (resp[2] >> 8) as u8,
            resp[2] as u8,
            (resp[1] >> 24) as u8,
            (resp[1] >> 16) as u8,
        ];

        Self {
            manufacturer_id: (resp[3] >> 16) as u8,
            oem_id: resp[3] as u16,
            product_name: pnm,
            product_revision: (resp[1] >> 8) as u8,
            serial_number: (resp[1] << 24) | (resp[0] >> 8),
            manufacturing_date: resp[0] as u8,
        }
    }

    pub fn product_name(&self) -> &str {
        let len = self
            .product_name
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(self.product_name.len());
        core::str::from_utf8(&self.product_name[..len]).unwrap_or("")
    }
}

/// Fields of the card specific data register the driver uses.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Csd {
    pub read_bl_len: u32,
    pub spec_version: u32,
    pub taac: u8,
    pub nsac: u8,
    pub tran_speed: u32,
    pub ccc: u32,
    pub c_size: u32,
    pub c_size_mult: u32,
}

impl Csd {
    pub fn parse(resp: &[u32; 4]) -> Self {
        Self {
            read_bl_len: (resp[2] >> 8) & 0xF,
            spec_version: (resp[3] >> 18) & 0xF,
            taac: (resp[3] >> 8) as u8,
            nsac: resp[3] as u8,
            tran_speed: resp[2] >> 24,
            ccc: (resp[2] >> 12) & 0xFFF,
            c_size: ((resp[1] >> 22) & 0x3FF) | ((resp[2] & 0x3) << 10),
            c_size_mult: (resp[1] >> 7) & 0x7,
        }
    }

    /// Page size in log2 bytes, capped at 512 B. `None` for a zero read
    /// block length, which no usable card reports.
    pub fn page_size_log2(&self) -> Option<u32> {
        match self.read_bl_len.min(EMMC_MAX_PAGE_SIZE_LOG2) {
            0 => None,
            len => Some(len),
        }
    }

    /// Maximum transfer rate in MHz.
    pub fn tran_speed_mhz(&self, family: &dyn SiliconFamily) -> u32 {
        if self.tran_speed == CSD_TRAN_SPEED_V43 {
            family.refine_v43_tran_speed(EMMC_TRAN_SPEED_V43_MHZ)
        } else {
            EMMC_TRAN_SPEED_DEFAULT_MHZ
        }
    }

    pub fn supports_high_speed(&self) -> bool {
        self.spec_version >= CSD_SPEC_VERS_4
    }

    /// Cards above 2 GB saturate both size fields and report their capacity
    /// in the extended CSD instead.
    pub fn capacity_in_ext_csd(&self) -> bool {
        self.c_size == CSD_MAX_C_SIZE && self.c_size_mult == CSD_MAX_C_SIZE_MULT
    }

    /// Capacity in pages, or `None` when it has to come from the extended CSD.
    pub fn capacity_pages(&self, page_size_log2: u32) -> Option<u32> {
        if self.capacity_in_ext_csd() {
            return None;
        }
        let mult = 1u32 << (self.c_size_mult + 2);
        let scale = 1u32 << self.read_bl_len.saturating_sub(page_size_log2);
        Some((self.c_size + 1) * mult * scale)
    }
}

/// Extended CSD fields the driver consumes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExtCsd {
    pub boot_partition_size: u32,
    pub partition_config: u8,
    pub bus_width: u8,
    pub hs_timing: u8,
    pub power_class: u8,
    pub card_type: u8,
    pub power_class_52_195: u8,
    pub power_class_26_195: u8,
    pub power_class_52_360: u8,
    pub power_class_26_360: u8,
    pub power_class_ddr_52_195: u8,
    pub power_class_ddr_52_360: u8,
    pub sector_count: u32,
}

impl ExtCsd {
    pub fn parse(raw: &[u8; EXT_CSD_SIZE]) -> Self {
        let sec = &raw[EXT_CSD_SEC_COUNT..EXT_CSD_SEC_COUNT + 4];
        Self {
            boot_partition_size: (raw[EXT_CSD_BOOT_SIZE_MULT] as u32) << EXT_CSD_BOOT_SIZE_SHIFT,
            partition_config: raw[EXT_CSD_PARTITION_CONFIG],
            bus_width: raw[EXT_CSD_BUS_WIDTH],
            hs_timing: raw[EXT_CSD_HS_TIMING],
            power_class: raw[EXT_CSD_POWER_CLASS],
            card_type: raw[EXT_CSD_CARD_TYPE],
            power_class_52_195: raw[EXT_CSD_PWR_CL_52_195],
            power_class_26_195: raw[EXT_CSD_PWR_CL_26_195],
            power_class_52_360: raw[EXT_CSD_PWR_CL_52_360],
            power_class_26_360: raw[EXT_CSD_PWR_CL_26_360],
            power_class_ddr_52_195: raw[EXT_CSD_PWR_CL_DDR_52_195],
            power_class_ddr_52_360: raw[EXT_CSD_PWR_CL_DDR_52_360],
            sector_count: u32::from_le_bytes([sec[0], sec[1], sec[2], sec[3]]),
        }
    }

    /// BOOT_PARTITION_ENABLE: 1 or 2 selects a boot partition.
    pub fn boot_partition_enable(&self) -> u8 {
        (self.partition_config >> EMMC_BOOT_PARTITION_ENABLE_SHIFT) & 0x7
    }

    pub fn supports_ddr_52_180_300(&self) -> bool {
        self.card_type & EXT_CSD_CARD_TYPE_DDR_52_180_300 != 0
    }
}
