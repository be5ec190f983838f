//! Services the driver consumes from the surrounding boot environment.

use cfg_if::cfg_if;

/// Free-running microsecond counter. Wraps at 2^32.
pub trait Timer {
    fn now_us(&self) -> u32;

    fn elapsed_us(&self, start: u32) -> u32 {
        // Wrapping subtraction keeps this correct across counter rollover.
        self.now_us().wrapping_sub(start)
    }

    fn wait_us(&self, us: u32) {
        let start = self.now_us();
        while self.elapsed_us(start) < us {
            core::hint::spin_loop();
        }
    }
}

/// Clock-and-reset unit lines feeding the SDMMC controller.
pub trait ClockReset {
    fn set_reset(&self, asserted: bool);
    fn set_clock_enable(&self, enabled: bool);
    /// Program the source divider field (already encoded by the silicon family).
    fn set_source_divider(&self, field: u32);
}

pub trait Platform: Timer + ClockReset {
    /// Bus address the controller's SDMA engine should use for `buffer`.
    fn dma_address(&self, buffer: &mut [u8]) -> u32;

    /// Chip identification value used to select the silicon family.
    fn chip_id(&self) -> u32;
}

/// Memory-mapped 32-bit microsecond timer register.
pub struct MmioUsTimer {
    addr: usize,
}

impl MmioUsTimer {
    /// # Safety
    ///
    /// `addr` must be the mapped address of a readable 32-bit µs counter.
    pub const unsafe fn new(addr: usize) -> Self {
        Self { addr }
    }
}

impl Timer for MmioUsTimer {
    fn now_us(&self) -> u32 {
        unsafe { core::ptr::read_volatile(self.addr as *const u32) }
    }
}

cfg_if! {
    if #[cfg(target_arch = "aarch64")] {
        pub use generic::GenericTimer;

        mod generic {
            use aarch64_cpu::registers::{CNTFRQ_EL0, CNTPCT_EL0, Readable};

            use super::Timer;

            /// Architected generic timer, scaled to microseconds.
            pub struct GenericTimer {
                freq: u64,
            }

            impl GenericTimer {
                pub fn new() -> Self {
                    Self { freq: CNTFRQ_EL0.get().max(1) }
                }
            }

            impl Default for GenericTimer {
                fn default() -> Self {
                    Self::new()
                }
            }

            impl Timer for GenericTimer {
                fn now_us(&self) -> u32 {
                    let ticks = CNTPCT_EL0.get() as u128;
                    (ticks * 1_000_000 / self.freq as u128) as u32
                }
            }
        }
    }
}
