// STREAMLINE — ENGINE: RUNTIME MODULE
// Infrastructure that supports the channel but isn't the protocol itself:
// fatal exit diagnostics, TSC clock and calibration, core pinning,
// real-time scheduling, and the C-state latency lock.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

// ============================================================================
// FATAL EXIT + DIAGNOSTIC ERROR CODES
// ============================================================================

// Convention: 0x10-0x1F = Boot. Nothing after the handshake is fatal.
pub const E_CONFIG: i32            = 0x10;
pub const E_AFFINITY_FAIL: i32     = 0x11;
pub const E_SCHED_FAIL: i32        = 0x12;
pub const E_AFFINITY_VERIFY: i32   = 0x13;
pub const E_SCHED_VERIFY: i32      = 0x14;
pub const E_SHARED_MAP: i32        = 0x15;
pub const E_OUTPUT_WRITE: i32      = 0x16;

/// Structured fatal exit. No heap allocation, no unwinding.
/// Output: "[STREAMLINE FATAL 0xHH] msg\n" in one writev() so two dying
/// processes on neighbouring cores never interleave their lines.
#[inline(never)]
pub fn fatal(code: i32, msg: &str) -> ! {
    let prefix = b"[STREAMLINE FATAL 0x";
    let hex = [
        b"0123456789ABCDEF"[((code >> 4) & 0xF) as usize],
        b"0123456789ABCDEF"[(code & 0xF) as usize],
    ];
    let suffix = b"] ";
    let newline = b"\n";
    let iov = [
        libc::iovec { iov_base: prefix.as_ptr() as *mut _, iov_len: prefix.len() },
        libc::iovec { iov_base: hex.as_ptr() as *mut _, iov_len: 2 },
        libc::iovec { iov_base: suffix.as_ptr() as *mut _, iov_len: suffix.len() },
        libc::iovec { iov_base: msg.as_ptr() as *mut _, iov_len: msg.len() },
        libc::iovec { iov_base: newline.as_ptr() as *mut _, iov_len: 1 },
    ];
    // SAFETY: fd 2 is always open. Every iov entry points at a live buffer
    // of the stated length.
    unsafe { libc::writev(2, iov.as_ptr(), 5); }
    std::process::exit(code);
}

// ============================================================================
// TSC CLOCK
// All channel timing is in raw cycles. Calibration against CLOCK_MONOTONIC is
// only used to turn the measured bit period into µs and bits/s.
// ============================================================================

#[inline(always)]
pub fn clock_ns() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: FFI call with valid mutable reference to timespec.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Counter rate measured against CLOCK_MONOTONIC. Only reporting uses it:
/// the channel itself counts raw cycles.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TscCal {
    mhz: Option<f64>,
}

impl TscCal {
    /// No usable counter rate; callers fall back to the configured clock.
    pub fn fallback() -> Self { TscCal { mhz: None } }

    /// Rate from one or more `(ticks, ns)` windows. Rejects empty windows and
    /// sets whose fastest and slowest window disagree by more than
    /// `CAL_MAX_SPREAD`.
    pub fn from_windows(windows: &[(u64, u64)]) -> Self {
        let mut rates: Vec<f64> = Vec::with_capacity(windows.len());
        for &(ticks, ns) in windows {
            if ticks == 0 || ns == 0 { return Self::fallback(); }
            rates.push(ticks as f64 * 1000.0 / ns as f64);
        }
        if rates.is_empty() { return Self::fallback(); }
        rates.sort_by(f64::total_cmp);
        let (lo, hi) = (rates[0], rates[rates.len() - 1]);
        if (hi - lo) / lo > CAL_MAX_SPREAD { return Self::fallback(); }
        TscCal { mhz: Some(rates[rates.len() / 2]) }
    }

    pub fn is_valid(&self) -> bool { self.mhz.is_some() }

    /// Counter frequency in MHz, or None when running on the fallback clock.
    pub fn mhz(&self) -> Option<f64> { self.mhz }
}

/// Calibration windows and the largest relative disagreement between them.
pub const CAL_WINDOWS: usize = 5;
pub const CAL_WINDOW: Duration = Duration::from_millis(20);
pub const CAL_MAX_SPREAD: f64 = 0.001;

/// Raw TSC read, unserialized. Good enough for "what time is it?".
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn read_tsc() -> u64 {
    let lo: u32;
    let hi: u32;
    // SAFETY: rdtsc only writes eax/edx.
    unsafe {
        core::arch::asm!(
            "rdtsc",
            out("eax") lo,
            out("edx") hi,
            options(nostack, nomem, preserves_flags)
        );
    }
    ((hi as u64) << 32) | (lo as u64)
}

/// CNTVCT_EL0: constant-rate, monotonic, unprivileged.
#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub fn read_tsc() -> u64 {
    let cnt: u64;
    // SAFETY: Reading the virtual count register has no memory effects.
    unsafe {
        core::arch::asm!(
            "mrs {cnt}, CNTVCT_EL0",
            cnt = out(reg) cnt,
            options(nostack, nomem, preserves_flags)
        );
    }
    cnt
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline(always)]
pub fn read_tsc() -> u64 { clock_ns() }

/// Serializing TSC read: waits for all prior instructions to retire.
/// Used where the read marks the end of a timed region.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn read_tscp() -> u64 {
    let lo: u32;
    let hi: u32;
    // SAFETY: rdtscp writes eax/edx/ecx only.
    unsafe {
        core::arch::asm!(
            "rdtscp",
            out("eax") lo,
            out("edx") hi,
            out("ecx") _,
            options(nostack, nomem, preserves_flags)
        );
    }
    ((hi as u64) << 32) | (lo as u64)
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub fn read_tscp() -> u64 {
    // SAFETY: isb has no memory effects; it orders the counter read.
    unsafe { core::arch::asm!("isb", options(nostack, nomem, preserves_flags)); }
    read_tsc()
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline(always)]
pub fn read_tscp() -> u64 { clock_ns() }

/// Whether the counter ticks at a constant rate through P- and C-state
/// changes. On x86 this is CPUID 0x8000_0007 EDX bit 8.
#[cfg(target_arch = "x86_64")]
pub fn has_invariant_tsc() -> bool {
    use core::arch::x86_64::__cpuid;
    // SAFETY: cpuid is available on every x86_64 CPU.
    let top = unsafe { __cpuid(0x8000_0000) }.eax;
    if top < 0x8000_0007 { return false; }
    // SAFETY: leaf checked against the highest supported extended leaf.
    let edx = unsafe { __cpuid(0x8000_0007) }.edx;
    edx & (1 << 8) != 0
}

/// CNTVCT_EL0 is architecturally constant-rate.
#[cfg(target_arch = "aarch64")]
pub fn has_invariant_tsc() -> bool { true }

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub fn has_invariant_tsc() -> bool { false }

/// Ticks and nanoseconds elapsed across one sleep.
fn sample_window(len: Duration) -> (u64, u64) {
    let (t0, n0) = (read_tscp(), clock_ns());
    std::thread::sleep(len);
    let (t1, n1) = (read_tscp(), clock_ns());
    (t1.wrapping_sub(t0), n1.saturating_sub(n0))
}

/// Measure the counter rate over `CAL_WINDOWS` short sleeps and keep the
/// median. Falls back when the counter is not invariant or the windows
/// disagree.
pub fn calibrate_tsc() -> TscCal {
    if !has_invariant_tsc() {
        warn!("counter is not invariant, reporting with the configured clock");
        return TscCal::fallback();
    }
    let windows: Vec<(u64, u64)> = (0..CAL_WINDOWS).map(|_| sample_window(CAL_WINDOW)).collect();
    let cal = TscCal::from_windows(&windows);
    match cal.mhz() {
        Some(mhz) => info!(mhz, windows = CAL_WINDOWS, "TSC calibrated"),
        None => warn!(?windows, "TSC windows disagree, reporting with the configured clock"),
    }
    cal
}

// ============================================================================
// CPU MANAGEMENT (pinning, real-time class, C-state lock)
// ============================================================================

/// Restrict the calling thread to `core`.
pub fn pin_to_core(core: usize) -> std::io::Result<()> {
    let setsize = 8 * std::mem::size_of::<libc::cpu_set_t>();
    if core >= setsize {
        return Err(std::io::Error::from(std::io::ErrorKind::InvalidInput));
    }
    // SAFETY: cpu_set_t is plain bits; all-zeroes is the empty set.
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    // SAFETY: `core` is inside the set, checked above.
    unsafe { libc::CPU_SET(core, &mut set) };
    // SAFETY: `set` lives on the stack for the call; pid 0 is this thread.
    match unsafe { libc::sched_setaffinity(0, std::mem::size_of_val(&set), &set) } {
        0 => Ok(()),
        _ => Err(std::io::Error::last_os_error()),
    }
}

/// Cross-checks the kernel's view (/proc) and the CPU we are running on.
pub fn verify_affinity(expected_core: usize) {
    use std::io::BufRead;
    // SAFETY: SYS_gettid always succeeds on Linux.
    let tid = unsafe { libc::syscall(libc::SYS_gettid) };
    let path = format!("/proc/self/task/{}/status", tid);
    let file = match std::fs::File::open(&path) {
        Ok(f) => f, Err(_) => match std::fs::File::open("/proc/self/status") {
            Ok(f) => f, Err(_) => fatal(E_AFFINITY_VERIFY, "Cannot open status file"),
        }
    };
    let mut seen = false;
    for l in std::io::BufReader::new(file).lines().map_while(Result::ok) {
        if let Some(rest) = l.strip_prefix("Cpus_allowed_list:") {
            if rest.trim() != expected_core.to_string() {
                fatal(E_AFFINITY_VERIFY, "Core affinity mismatch");
            }
            seen = true;
            break;
        }
    }
    if !seen { fatal(E_AFFINITY_VERIFY, "Could not verify affinity"); }
    // SAFETY: sched_getcpu takes no arguments.
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 || cpu as usize != expected_core {
        fatal(E_AFFINITY_VERIFY, "Running on unexpected CPU");
    }
}

/// Switch the calling thread to SCHED_FIFO. Returns the priority applied.
pub fn set_realtime_fifo(priority: Option<i32>) -> i32 {
    // SAFETY: sched_get_priority_max is a pure query.
    let max = unsafe { libc::sched_get_priority_max(libc::SCHED_FIFO) };
    if max < 0 { fatal(E_SCHED_FAIL, "sched_get_priority_max failed"); }
    let prio = priority.unwrap_or(max);
    let param = libc::sched_param { sched_priority: prio };
    // SAFETY: param is a valid sched_param on the stack; pid 0 is this thread.
    if unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) } != 0 {
        fatal(E_SCHED_FAIL, "sched_setscheduler(SCHED_FIFO) failed");
    }
    prio
}

pub fn verify_scheduling(expected_priority: i32) {
    // SAFETY: pid 0 queries the calling thread.
    let policy = unsafe { libc::sched_getscheduler(0) };
    if policy != libc::SCHED_FIFO { fatal(E_SCHED_VERIFY, "Scheduling policy is not SCHED_FIFO"); }
    let mut param = libc::sched_param { sched_priority: 0 };
    // SAFETY: param is a valid out-pointer.
    if unsafe { libc::sched_getparam(0, &mut param) } != 0 {
        fatal(E_SCHED_VERIFY, "sched_getparam failed");
    }
    if param.sched_priority != expected_priority {
        fatal(E_SCHED_VERIFY, "Scheduling priority mismatch");
    }
}

/// Pin, elevate, and verify. One call per process at startup.
pub fn claim_core(core: usize, priority: Option<i32>) -> i32 {
    if let Err(e) = pin_to_core(core) {
        warn!(core, error = %e, "sched_setaffinity failed");
        fatal(E_AFFINITY_FAIL, "sched_setaffinity failed");
    }
    let prio = set_realtime_fifo(priority);
    verify_affinity(core);
    verify_scheduling(prio);
    info!(core, priority = prio, "pinned under SCHED_FIFO");
    prio
}

pub const DMA_LATENCY_PATH: &str = "/dev/cpu_dma_latency";

/// Ask for a zero-microsecond wakeup latency through `path` and read the
/// request back. The request lasts as long as the returned file stays open.
pub fn request_zero_latency(path: &Path) -> std::io::Result<File> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    file.write_all(&0i32.to_ne_bytes())?;
    file.seek(SeekFrom::Start(0))?;
    let mut held = [0u8; 4];
    file.read_exact(&mut held)?;
    match i32::from_ne_bytes(held) {
        0 => Ok(file),
        other => Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("latency request reads back as {}us", other),
        )),
    }
}

/// Keep the core in C0 for the rest of the process. Failure is logged, not
/// fatal. Returns whether the lock is held.
pub fn lock_cstates() -> bool {
    match request_zero_latency(Path::new(DMA_LATENCY_PATH)) {
        Ok(file) => {
            // Closing the fd would drop the request.
            std::mem::forget(file);
            info!("C-state locked: max_latency=0us");
            true
        }
        Err(e) => {
            warn!(error = %e, "C-state lock unavailable, continuing");
            false
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_has_no_frequency() {
        let cal = TscCal::fallback();
        assert!(!cal.is_valid());
        assert_eq!(cal.mhz(), None);
    }

    #[test]
    fn median_window_sets_rate() {
        // 4000 ticks per µs, one window slightly slow.
        let cal = TscCal::from_windows(&[(80_000_000, 20_000_000), (80_000_000, 20_000_000), (80_020_000, 20_010_000)]);
        assert_eq!(cal.mhz(), Some(4000.0));
    }

    #[test]
    fn disagreeing_windows_fall_back() {
        let cal = TscCal::from_windows(&[(80_000_000, 20_000_000), (60_000_000, 20_000_000)]);
        assert!(!cal.is_valid());
        assert!(!TscCal::from_windows(&[]).is_valid());
        assert!(!TscCal::from_windows(&[(0, 20_000_000)]).is_valid());
        assert!(!TscCal::from_windows(&[(80_000_000, 0)]).is_valid());
    }

    #[test]
    fn tsc_is_monotonic() {
        let a = read_tsc();
        let b = read_tscp();
        assert!(b >= a);
    }

    #[test]
    fn out_of_range_core_is_rejected() {
        let e = pin_to_core(usize::MAX).unwrap_err();
        assert_eq!(e.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[test]
    fn zero_latency_request_reads_back() {
        let path = std::env::temp_dir().join(format!("streamline-dma-{}", std::process::id()));
        std::fs::write(&path, [0xFFu8; 4]).unwrap();
        let held = request_zero_latency(&path);
        assert!(held.is_ok());
        drop(held);
        assert_eq!(std::fs::read(&path).unwrap(), 0i32.to_ne_bytes());
        std::fs::remove_file(&path).unwrap();
        assert!(request_zero_latency(&path).is_err());
    }
}
