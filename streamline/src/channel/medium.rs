// STREAMLINE — CHANNEL: SHARED MEDIUM
// Address arithmetic for the shared region (pure, no state) and the read-only
// mapping of the backing file that both processes open independently.
//
// Both ends compute every address from (base, logical index) alone. Nothing
// address-shaped ever crosses between the processes.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::channel::timing::TimingSource;
use crate::engine::protocol::*;
use crate::error::ChannelError;

// ============================================================================
// SLOT MAPPING
// ============================================================================

/// Page of logical slot `l`. Even and odd slots alternate between the two
/// pages of a pair; the pair advances every ~21 slot pairs.
#[inline(always)]
pub const fn page_of(l: u64) -> u64 {
    ((l / 2) * SLOT_LINE_STRIDE / LINES_PER_PAGE) * 2 + l % 2
}

/// Line of logical slot `l` inside its page: a stride-3 walk from line 14.
#[inline(always)]
pub const fn line_of(l: u64) -> u64 {
    ((l / 2) * SLOT_LINE_STRIDE + SLOT_LINE_BASE) % LINES_PER_PAGE
}

/// u64 entry index of logical slot `l`, before wrapping into the array.
#[inline(always)]
pub const fn logical_entry(l: u64) -> u64 {
    page_of(l) * ENTRIES_PER_PAGE + line_of(l) * ENTRIES_PER_LINE
}

// ============================================================================
// CHANNEL LAYOUT
// ============================================================================

#[derive(Clone, Copy, Debug)]
pub struct ChannelLayout {
    base: usize,
    array_entries: u64,
    first_slot: u64,
}

impl ChannelLayout {
    pub fn new(base: usize, geometry: &ChannelGeometry) -> Self {
        ChannelLayout { base, array_entries: geometry.array_entries(), first_slot: geometry.first_slot }
    }

    pub fn base(&self) -> usize { self.base }

    /// Entry index inside the communication array for transmitted bit `bit_index`.
    #[inline(always)]
    pub fn slot_entry(&self, bit_index: u64) -> u64 {
        logical_entry(self.first_slot + bit_index) % self.array_entries + SLOT_ENTRY_SHIFT
    }

    #[inline(always)]
    pub fn slot_address(&self, bit_index: u64) -> usize {
        self.array_base() + (self.slot_entry(bit_index) * ENTRY_SIZE) as usize
    }

    #[inline(always)]
    pub fn array_base(&self) -> usize { self.base + OFFSET_ARRAY as usize }

    pub fn array_lines(&self) -> u64 { self.array_entries / ENTRIES_PER_LINE }

    pub fn array_line(&self, line: u64) -> usize {
        self.array_base() + (line * CACHE_LINE) as usize
    }

    pub fn handshake_line(&self) -> usize { self.base + OFFSET_HANDSHAKE as usize }

    pub fn rx_ready(&self) -> [usize; 3] { OFFSET_RX_READY.map(|o| self.base + o as usize) }

    pub fn tx_ready(&self) -> [usize; 3] { OFFSET_TX_READY.map(|o| self.base + o as usize) }

    /// Evict every line of the communication array.
    pub fn flush_array<T: TimingSource>(&self, timing: &T) {
        for line in 0..self.array_lines() {
            timing.evict(self.array_line(line));
        }
    }

    /// Evict all six ready registers.
    pub fn flush_registers<T: TimingSource>(&self, timing: &T) {
        for addr in self.rx_ready().into_iter().chain(self.tx_ready()) {
            timing.evict(addr);
        }
    }
}

// ============================================================================
// SHARED REGION — read-only MAP_SHARED view of the backing file
// ============================================================================

pub struct SharedRegion {
    map: *mut libc::c_void,
    map_len: usize,
    base: usize,
    array_bytes: usize,
    path: PathBuf,
}

impl SharedRegion {
    /// Map `path` read-only. The channel starts `offset_bytes` into the file.
    pub fn open(path: &Path, offset_bytes: u64, geometry: &ChannelGeometry) -> Result<Self, ChannelError> {
        let file = File::open(path).map_err(|source| ChannelError::Open { path: path.to_path_buf(), source })?;
        let actual = file.metadata()
            .map_err(|source| ChannelError::Open { path: path.to_path_buf(), source })?
            .len();
        if offset_bytes >= actual {
            return Err(ChannelError::Offset { offset: offset_bytes, len: actual });
        }
        let required = offset_bytes + geometry.mapping_len();
        if actual < required {
            return Err(ChannelError::TooSmall { path: path.to_path_buf(), actual, required });
        }
        let map_len = required as usize;
        // SAFETY: fd is a valid open file of at least map_len bytes. PROT_READ
        // + MAP_SHARED never writes through the mapping. The fd may be closed
        // once mmap returns.
        let map = unsafe {
            libc::mmap(core::ptr::null_mut(), map_len, libc::PROT_READ, libc::MAP_SHARED, file.as_raw_fd(), 0)
        };
        if map == libc::MAP_FAILED {
            return Err(ChannelError::Map { len: map_len, source: std::io::Error::last_os_error() });
        }
        let base = map as usize + offset_bytes as usize;
        info!(path = %path.display(), map_len, offset_bytes, "shared region mapped");
        Ok(SharedRegion {
            map, map_len, base,
            array_bytes: geometry.array_bytes() as usize,
            path: path.to_path_buf(),
        })
    }

    pub fn base(&self) -> usize { self.base }

    pub fn path(&self) -> &Path { &self.path }

    pub fn layout(&self, geometry: &ChannelGeometry) -> ChannelLayout {
        ChannelLayout::new(self.base, geometry)
    }

    fn array_bytes_view(&self) -> &[u8] {
        // SAFETY: [base + OFFSET_ARRAY, +array_bytes) lies inside the mapping
        // (checked against the file size in open) and lives as long as self.
        unsafe {
            core::slice::from_raw_parts((self.base + OFFSET_ARRAY as usize) as *const u8, self.array_bytes)
        }
    }

    /// Stream through the whole communication array so every page is faulted
    /// in and the TLB is warm. Returns the sum so the reads cannot be elided.
    pub fn prime(&self) -> Result<u64, ChannelError> {
        let words: &[u64] = bytemuck::try_cast_slice(self.array_bytes_view())
            .map_err(|_| ChannelError::Misaligned)?;
        let sum = words.iter().fold(0u64, |acc, w| acc.wrapping_add(*w));
        Ok(std::hint::black_box(sum))
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: map/map_len are exactly what mmap returned in open().
        unsafe { libc::munmap(self.map, self.map_len); }
    }
}

// ============================================================================
// TESTS
// ============================================================================
