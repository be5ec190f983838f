pub const fn quotient_ceiling(dividend: u32, divisor: u32) -> u32 {
    dividend.div_ceil(divisor)
}

pub const fn clamp_read_timeout(us: u32, min: u32, max: u32) -> u32 {
    if us < min {
        min
    } else if us > max {
        max
    } else {
        us
    }
}

// Access time units from the CSD TAAC field, scaled by 10 to match the multipliers.
const TAAC_TIME_UNIT: [u32; 8] = [1, 10, 100, 1000, 10_000, 100_000, 1_000_000, 10_000_000];
const TAAC_MULTIPLIER: [u32; 16] = [10, 10, 12, 13, 15, 20, 25, 30, 35, 40, 45, 50, 55, 60, 70, 80];

/// Read access time in µs (10x TAAC + NSAC, rounded up) for a card cycle of
/// `card_cycle_ns`.
pub fn access_time_us(taac: u8, nsac: u8, card_cycle_ns: u32) -> u32 {
    let taac = TAAC_TIME_UNIT[(taac & 0x7) as usize] as u64
        * TAAC_MULTIPLIER[((taac >> 3) & 0xF) as usize] as u64;
    let nsac = card_cycle_ns as u64 * nsac as u64 * 1000;
    (taac + nsac).div_ceil(1000).min(u32::MAX as u64) as u32
}
