// STREAMLINE — CHANNEL: TIMING PRIMITIVES
// The only place that touches the cache directly. Everything above this layer
// speaks TimingSource, so the same protocol code runs on hardware and on the
// in-process simulator.

use crate::engine::runtime::{read_tsc, read_tscp};

/// Cycle counter, eviction, and timed loads on raw addresses.
///
/// Implementations must keep the timed region free of unrelated memory
/// traffic: measure() reads the counter, performs exactly one load, and reads
/// the counter again.
pub trait TimingSource {
    fn now(&self) -> u64;
    /// Force the line holding `addr` out of every cache level.
    fn evict(&self, addr: usize);
    /// Untimed load.
    fn touch(&self, addr: usize);
    /// Timed load, in cycles.
    fn measure(&self, addr: usize) -> u64;
    /// Speculation barrier.
    fn serialize(&self) {}
    /// Busy-wait for `cycles`.
    fn delay(&self, cycles: u64) {
        let start = self.now();
        while self.now().wrapping_sub(start) < cycles {
            core::hint::spin_loop();
        }
    }
}

/// Constant-time address select: `addr_if_1` when `bit` is set, else `addr_if_0`.
/// Compiles to a mask and two ANDs, never a branch.
#[inline(always)]
pub fn select(addr_if_1: usize, addr_if_0: usize, bit: bool) -> usize {
    let mask = 0usize.wrapping_sub(bit as usize);
    (addr_if_1 & mask) | (addr_if_0 & !mask)
}

#[inline(always)]
pub const fn is_hit(latency: u64, threshold: u64) -> bool {
    latency <= threshold
}

// ============================================================================
// HARDWARE TIMING
// ============================================================================

/// TimingSource over real memory. Addresses are dereferenced as-is.
#[derive(Clone, Copy, Debug)]
pub struct HardwareTiming {
    _private: (),
}

impl HardwareTiming {
    /// # Safety
    /// Every address later handed to this source must lie inside a live,
    /// readable mapping for as long as the source is used.
    pub unsafe fn new() -> Self { HardwareTiming { _private: () } }
}

#[cfg(target_arch = "x86_64")]
impl TimingSource for HardwareTiming {
    #[inline(always)]
    fn now(&self) -> u64 { read_tsc() }

    #[inline(always)]
    fn evict(&self, addr: usize) {
        // SAFETY: Constructor contract: addr is inside a live mapping.
        unsafe { core::arch::x86_64::_mm_clflush(addr as *const u8); }
    }

    #[inline(always)]
    fn touch(&self, addr: usize) {
        // SAFETY: Constructor contract: addr is inside a live mapping.
        unsafe { core::ptr::read_volatile(addr as *const u8); }
    }

    #[inline(always)]
    fn measure(&self, addr: usize) -> u64 {
        use core::arch::x86_64::{_mm_lfence, _mm_mfence};
        // SAFETY: Fences have no memory-safety preconditions; addr is inside
        // a live mapping per the constructor contract.
        unsafe {
            _mm_mfence();
            _mm_lfence();
            let t0 = read_tsc();
            _mm_lfence();
            core::ptr::read_volatile(addr as *const u8);
            let t1 = read_tscp();
            _mm_lfence();
            t1.wrapping_sub(t0)
        }
    }

    #[inline(always)]
    fn serialize(&self) {
        // SAFETY: cpuid is available on every x86_64 CPU.
        unsafe { core::arch::x86_64::__cpuid(0); }
    }
}

#[cfg(target_arch = "aarch64")]
impl TimingSource for HardwareTiming {
    #[inline(always)]
    fn now(&self) -> u64 { read_tsc() }

    #[inline(always)]
    fn evict(&self, addr: usize) {
        // SAFETY: dc civac on an address inside a live mapping.
        unsafe {
            core::arch::asm!("dc civac, {a}", "dsb ish", a = in(reg) addr, options(nostack, preserves_flags));
        }
    }

    #[inline(always)]
    fn touch(&self, addr: usize) {
        // SAFETY: Constructor contract: addr is inside a live mapping.
        unsafe { core::ptr::read_volatile(addr as *const u8); }
    }

    #[inline(always)]
    fn measure(&self, addr: usize) -> u64 {
        let t0 = read_tscp();
        // SAFETY: Constructor contract: addr is inside a live mapping.
        unsafe { core::ptr::read_volatile(addr as *const u8); }
        read_tscp().wrapping_sub(t0)
    }

    #[inline(always)]
    fn serialize(&self) {
        // SAFETY: isb has no memory effects.
        unsafe { core::arch::asm!("isb", options(nostack, nomem, preserves_flags)); }
    }
}

// No user-level flush elsewhere: eviction is a no-op and the channel degrades
// to noise, which the analysis reports honestly.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
impl TimingSource for HardwareTiming {
    fn now(&self) -> u64 { read_tsc() }
    fn evict(&self, _addr: usize) {}
    fn touch(&self, addr: usize) {
        // SAFETY: Constructor contract: addr is inside a live mapping.
        unsafe { core::ptr::read_volatile(addr as *const u8); }
    }
    fn measure(&self, addr: usize) -> u64 {
        let t0 = read_tscp();
        self.touch(addr);
        read_tscp().wrapping_sub(t0)
    }
}

// ============================================================================
// TESTS
// ============================================================================
