//! Shared fixtures for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use dma_pool::{DmaRegion, PhysAddr};

use crate::cache::{CacheOps, CpuCaps};
use crate::config::DmaConfig;
use crate::constraints::ConstraintRegistry;
use crate::dma::{AddressResolver, Direction, DmaBuffer, DmaMapper, Segment, SegmentList};
use crate::platform::{
    LinearMap, NoTranslation, TranslatedRegion, TranslationError, TranslationHandle, TranslationService,
};
use crate::time::TickClock;

pub type TestMapper = DmaMapper<NoTranslation, &'static RecordingCacheOps, TickClock>;

/// Leak a zeroed region of `size` bytes that the device sees at `bus`.
pub fn leaked_region(size: usize, bus: u64) -> DmaRegion {
    let backing: &'static mut [u8] = Box::leak(vec![0u8; size].into_boxed_slice());
    unsafe { DmaRegion::new(backing.as_mut_ptr(), PhysAddr::new(bus), size) }
}

/// Leak a buffer filled with `fill`, aligned to `align` bytes.
pub fn leaked_buffer(len: usize, align: usize, fill: u8) -> DmaBuffer {
    let backing: &'static mut [u8] = Box::leak(vec![fill; len + align].into_boxed_slice());
    let skip = backing.as_ptr().align_offset(align);
    DmaBuffer::from_static(&mut backing[skip..skip + len])
}

/// Mapper over the default device classes plus `count` buffers of `size`
/// bytes that it maps in place at bus address 0x0020_0000 onwards.
pub fn direct_mapper(count: usize, size: usize) -> (TestMapper, Vec<DmaBuffer>) {
    let backing: &'static mut [u8] = Box::leak(vec![0u8; count * size + 64].into_boxed_slice());
    let skip = backing.as_ptr().align_offset(64);
    let base = backing[skip..].as_mut_ptr();
    let buffers = (0..count)
        .map(|i| unsafe { DmaBuffer::from_raw_parts(base.add(i * size), size) }.unwrap())
        .collect();

    let resolver = AddressResolver::unvirtualized(LinearMap::new(base as usize, PhysAddr::new(0x0020_0000)));
    let ops: &'static RecordingCacheOps = Box::leak(Box::default());
    let caps = CpuCaps {
        clflush: true,
        wbinvd: true,
        has_cache: true,
        line_size: 64,
    };
    let mapper = DmaMapper::init(
        &DmaConfig::default(),
        ConstraintRegistry::with_defaults(),
        resolver,
        &leaked_region(0x1_0000, 0x0010_0000),
        caps,
        ops,
        TickClock::new(1),
    )
    .unwrap();
    (mapper, buffers)
}

/// Cache backend that only counts.
#[derive(Debug, Default)]
pub struct RecordingCacheOps {
    pub lines: AtomicUsize,
    pub globals: AtomicUsize,
    pub fences: AtomicUsize,
}

impl RecordingCacheOps {
    pub fn lines(&self) -> usize {
        self.lines.load(Ordering::SeqCst)
    }

    pub fn globals(&self) -> usize {
        self.globals.load(Ordering::SeqCst)
    }
}

impl CacheOps for RecordingCacheOps {
    unsafe fn flush_line(&self, _addr: *const u8) {
        self.lines.fetch_add(1, Ordering::SeqCst);
    }

    unsafe fn write_back_invalidate_all(&self) {
        self.globals.fetch_add(1, Ordering::SeqCst);
    }

    fn fence(&self) {
        self.fences.fetch_add(1, Ordering::SeqCst);
    }
}

/// Translation service returning a fixed physical layout.
#[derive(Debug, Default)]
pub struct ScriptedTranslation {
    /// Physical start of each segment; the request is cut into equal pieces.
    pub bases: Vec<u64>,
    /// Describe this many bytes fewer than requested.
    pub short_by: usize,
    pub fail_with: Option<TranslationError>,
    /// Refuse every unlock.
    pub fail_unlock: bool,
    locks: usize,
    unlocked: Vec<u32>,
}

impl ScriptedTranslation {
    pub fn contiguous(base: PhysAddr) -> Self {
        Self {
            bases: vec![base.as_u64()],
            ..Self::default()
        }
    }

    pub fn scattered(bases: &[u64]) -> Self {
        Self {
            bases: bases.to_vec(),
            ..Self::default()
        }
    }

    /// Service that refuses every lock with `err`.
    pub fn failing(err: TranslationError) -> Self {
        Self {
            fail_with: Some(err),
            ..Self::default()
        }
    }

    pub fn refusing_unlock(mut self) -> Self {
        self.fail_unlock = true;
        self
    }

    pub fn locks(&self) -> usize {
        self.locks
    }

    pub fn unlocks(&self) -> usize {
        self.unlocked.len()
    }
}

impl TranslationService for ScriptedTranslation {
    fn lock(
        &mut self,
        _virt: usize,
        len: usize,
        _direction: Direction,
    ) -> Result<TranslatedRegion, TranslationError> {
        if let Some(err) = self.fail_with {
            return Err(err);
        }
        let len = len - self.short_by;
        let n = self.bases.len();
        let chunk = len / n;
        let mut segments = SegmentList::new();
        for (i, base) in self.bases.iter().enumerate() {
            let seg_len = if i == n - 1 { len - chunk * (n - 1) } else { chunk };
            segments
                .push(Segment::new(PhysAddr::new(*base), seg_len))
                .map_err(|_| TranslationError::TooManySegments)?;
        }
        self.locks += 1;
        Ok(TranslatedRegion {
            segments,
            handle: TranslationHandle::new(self.locks as u32),
        })
    }

    fn unlock(&mut self, handle: TranslationHandle) -> Result<(), TranslationError> {
        if self.fail_unlock {
            return Err(TranslationError::InvalidHandle);
        }
        if self.unlocked.contains(&handle.raw()) {
            return Err(TranslationError::InvalidHandle);
        }
        self.unlocked.push(handle.raw());
        Ok(())
    }
}
