//! The map/unmap façade.
//!
//! # Strategy order
//!
//! ```text
//!   request ──check──▶ resolve ──▶ validate ──ok──▶ Direct / Translated
//!                                     │
//!                                     └─fail──▶ unlock ──▶ Bounced
//! ```
//!
//! Only when the bounce path also fails does the caller see an error, and
//! the caller's buffer always comes back with it.

use bitflags::bitflags;
use dma_pool::{align_down, align_up, BounceLease, BouncePools, DmaRegion, PhysAddr, PoolKind};

use super::buffer::DmaBuffer;
use super::resolve::AddressResolver;
use super::segment::SegmentList;
use super::validate::{self, BoundaryValidator, Classification, Violations};
use super::Direction;
use crate::cache::{CacheOps, CoherencyConfig, CoherencyManager, CpuCaps};
use crate::config::DmaConfig;
use crate::constraints::{ConstraintDescriptor, ConstraintRegistry, DeviceClassId};
use crate::error::{DmaError, Result};
use crate::platform::{TranslationHandle, TranslationService};
use crate::stats::{MapCounters, StatsSnapshot};
use crate::time::Clock;

bitflags! {
    /// Per-mapping options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: u8 {
        /// Skip direct mapping and always bounce.
        const FORCE_BOUNCE = 1 << 0;
        /// Caller knows this memory is coherent; no cache maintenance.
        const COHERENT = 1 << 1;
        /// Caller does its own cache maintenance.
        const NO_SYNC = 1 << 2;
        /// Fail instead of falling back to a bounce buffer.
        const NO_BOUNCE = 1 << 3;
        /// Queue the global flush instead of flushing now. The caller must
        /// call `flush_pending` before ringing the doorbell.
        const COALESCE = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingKind {
    /// Buffer used in place at its linear-map address.
    Direct,
    /// Buffer used in place, pinned by the translation service.
    Translated,
    /// Data staged through a bounce entry.
    Bounced,
}

/// A buffer the device currently owns.
///
/// Holds the caller's buffer, so the CPU cannot touch it until
/// [`Unmap::unmap`] gives it back.
#[must_use = "dropping a Mapping leaks its bounce entry and translation lock"]
#[derive(Debug)]
pub struct Mapping {
    buffer: DmaBuffer,
    len: usize,
    direction: Direction,
    kind: MappingKind,
    class: DeviceClassId,
    segments: SegmentList,
    bounce: Option<BounceLease>,
    translation: Option<TranslationHandle>,
    flags: MapFlags,
    needs_sync: bool,
}

impl Mapping {
    /// Bus address of the first segment.
    pub fn phys_addr(&self) -> PhysAddr {
        self.segments.first().map_or(PhysAddr::ZERO, |s| s.addr)
    }

    /// What to program into the device's descriptors.
    pub fn segments(&self) -> &SegmentList {
        &self.segments
    }

    /// Transfer length.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn kind(&self) -> MappingKind {
        self.kind
    }

    pub fn class(&self) -> DeviceClassId {
        self.class
    }

    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    pub fn uses_bounce(&self) -> bool {
        self.bounce.is_some()
    }

    pub fn uses_translation(&self) -> bool {
        self.translation.is_some()
    }

    /// The caller's bytes, for streaming reuse.
    ///
    /// Only meaningful between `sync_for_cpu` and `sync_for_device`.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.buffer.as_mut_slice()[..len]
    }

    /// Memory the device actually reads or writes.
    pub(crate) fn dma_ptr(&self) -> *mut u8 {
        self.bounce
            .as_ref()
            .map_or(self.buffer.as_ptr(), |lease| lease.as_ptr())
    }
}

/// A failed `map`: the reason, and the buffer handed back untouched.
#[derive(Debug)]
pub struct MapFailure {
    pub error: DmaError,
    pub buffer: DmaBuffer,
}

/// Anything that can take a mapping back from the device.
///
/// The completion queue drains through this, which keeps it independent of
/// the mapper's type parameters.
pub trait Unmap {
    /// Finish a transfer and return the caller's buffer. Never fails.
    fn unmap(&mut self, mapping: Mapping) -> DmaBuffer;
}

/// How a request will be carried, before the Mapping is built.
struct Plan {
    kind: MappingKind,
    segments: SegmentList,
    bounce: Option<BounceLease>,
    translation: Option<TranslationHandle>,
}

/// The DMA mapping context: one per driver instance.
pub struct DmaMapper<T, O, C> {
    registry: ConstraintRegistry,
    resolver: AddressResolver<T>,
    validator: BoundaryValidator,
    pools: BouncePools,
    coherency: CoherencyManager<O, C>,
    counters: MapCounters,
}

impl<T, O, C> DmaMapper<T, O, C>
where
    T: TranslationService,
    O: CacheOps,
    C: Clock,
{
    /// Build the pools and the coherency manager from `config`, then the
    /// mapper.
    ///
    /// Pools are placed to satisfy the strictest combination of every
    /// registered device class, so register every class first.
    pub fn init(
        config: &DmaConfig,
        registry: ConstraintRegistry,
        resolver: AddressResolver<T>,
        region: &DmaRegion,
        caps: CpuCaps,
        ops: O,
        clock: C,
    ) -> Result<Self> {
        config.validate()?;
        let strictest = registry
            .strictest()
            .ok_or(DmaError::InvalidConfig("no device classes registered"))?;

        let mut coherency = CoherencyConfig::probe(&caps, resolver.mode()).with_coalescing(
            config.coalescing,
            config.flush_threshold,
            config.max_flush_delay_ms,
        );
        if let Some(tier) = config.cache_tier {
            coherency = coherency.with_tier(tier);
        }

        let pools = BouncePools::new(
            region,
            config.tx_bounce_entries,
            config.rx_bounce_entries,
            config.bounce_entry_size,
            strictest.placement(caps.line_size),
        )?;

        Self::new(
            registry,
            resolver,
            pools,
            CoherencyManager::new(coherency, ops, clock),
        )
    }

    /// Assemble a mapper from prebuilt parts.
    ///
    /// Fails if any pool entry is unusable by any registered device class,
    /// including entries longer than a class can describe in its segments.
    pub fn new(
        registry: ConstraintRegistry,
        resolver: AddressResolver<T>,
        pools: BouncePools,
        coherency: CoherencyManager<O, C>,
    ) -> Result<Self> {
        let entry_size = pools.entry_size();
        for (kind, phys) in pools.entries() {
            for (name, descriptor) in registry.iter() {
                let v = validate::validate(phys, entry_size, descriptor);
                if !v.ok() {
                    log::error!(
                        "dma: {:?} bounce entry {} unusable by '{}': {:?}",
                        kind,
                        phys,
                        name,
                        v
                    );
                    return Err(DmaError::ConstraintViolation(v));
                }
                if validate::split(phys, entry_size, descriptor).is_err() {
                    log::error!(
                        "dma: {:#x}-byte bounce entry needs more segments than '{}' takes",
                        entry_size,
                        name
                    );
                    return Err(DmaError::TooManySegments);
                }
            }
        }

        log::info!(
            "dma: mapper ready, {} device classes, {} bounce entries, cache tier {:?}",
            registry.len(),
            pools.entries().count(),
            coherency.tier()
        );

        Ok(Self {
            registry,
            resolver,
            validator: BoundaryValidator::new(),
            pools,
            coherency,
            counters: MapCounters::default(),
        })
    }

    /// Hand `len` bytes of `buffer` to a device of class `class`.
    pub fn map(
        &mut self,
        class: DeviceClassId,
        buffer: DmaBuffer,
        len: usize,
        direction: Direction,
        flags: MapFlags,
    ) -> core::result::Result<Mapping, MapFailure> {
        let descriptor = match self.registry.get(class) {
            Some(d) => *d,
            None => return Err(self.fail(DmaError::UnknownDeviceClass, buffer)),
        };
        match self.plan(&descriptor, &buffer, len, direction, flags) {
            Ok(plan) => Ok(self.finish(plan, &descriptor, class, buffer, len, direction, flags)),
            Err(error) => Err(self.fail(error, buffer)),
        }
    }

    /// Map a frame for transmit.
    pub fn map_tx(
        &mut self,
        class: DeviceClassId,
        buffer: DmaBuffer,
        len: usize,
        flags: MapFlags,
    ) -> core::result::Result<Mapping, MapFailure> {
        self.map(class, buffer, len, Direction::ToDevice, flags)
    }

    /// Map a receive buffer.
    pub fn map_rx(
        &mut self,
        class: DeviceClassId,
        buffer: DmaBuffer,
        len: usize,
        flags: MapFlags,
    ) -> core::result::Result<Mapping, MapFailure> {
        self.map(class, buffer, len, Direction::FromDevice, flags)
    }

    /// Hand a mapping back to the device after the CPU changed the buffer.
    pub fn sync_for_device(&mut self, mapping: &mut Mapping) {
        if mapping.direction.device_reads() {
            let len = mapping.len;
            if let Some(lease) = mapping.bounce.as_mut() {
                lease.fill(&mapping.buffer.as_slice()[..len]);
            }
        }
        if mapping.needs_sync {
            // SAFETY: the mapping owns both the buffer and any bounce entry.
            unsafe {
                self.coherency
                    .sync_for_device(mapping.dma_ptr(), mapping.len, mapping.direction)
            };
        }
    }

    /// Let the CPU look at what the device wrote, keeping the mapping.
    pub fn sync_for_cpu(&mut self, mapping: &mut Mapping) {
        if !mapping.direction.device_writes() {
            return;
        }
        if mapping.needs_sync {
            // SAFETY: as in `sync_for_device`.
            unsafe {
                self.coherency
                    .sync_for_cpu(mapping.dma_ptr(), mapping.len, mapping.direction)
            };
        }
        let len = mapping.len;
        if let Some(lease) = mapping.bounce.as_ref() {
            lease.copy_out(&mut mapping.buffer.as_mut_slice()[..len]);
        }
    }

    /// Run any coalesced global flush now. Call before telling the device to
    /// read memory mapped with [`MapFlags::COALESCE`].
    pub fn flush_pending(&self) -> bool {
        self.coherency.force_flush()
    }

    /// Periodic housekeeping: flush coalesced work past its deadline.
    pub fn poll(&self) -> bool {
        self.coherency.flush_if_due()
    }

    pub fn stats(&self) -> StatsSnapshot {
        let c = &self.counters;
        let violations = self.validator.stats();
        let cache = self.coherency.stats();
        StatsSnapshot {
            direct_mappings: c.direct,
            translated_mappings: c.translated,
            bounce_mappings: c.bounced,
            active_mappings: c.active,
            map_errors: c.errors,
            bounce_fallbacks: c.fallbacks,
            translation_release_errors: c.release_errors,
            tx_pool_exhausted: self.pools.pool(PoolKind::Tx).exhaustion_count(),
            rx_pool_exhausted: self.pools.pool(PoolKind::Rx).exhaustion_count(),
            cache_syncs: cache.tx_syncs + cache.rx_syncs,
            global_flushes: cache.global_flushes,
            coalesced_flushes: cache.coalesced,
            boundary_violations: violations.boundary,
            total_violations: violations.total(),
            ..StatsSnapshot::default()
        }
    }

    pub fn registry(&self) -> &ConstraintRegistry {
        &self.registry
    }

    pub fn resolver(&self) -> &AddressResolver<T> {
        &self.resolver
    }

    pub fn validator(&self) -> &BoundaryValidator {
        &self.validator
    }

    pub fn pools(&self) -> &BouncePools {
        &self.pools
    }

    pub fn coherency(&self) -> &CoherencyManager<O, C> {
        &self.coherency
    }

    // ── internals ──────────────────────────────────────────────────────────

    fn plan(
        &mut self,
        descriptor: &ConstraintDescriptor,
        buffer: &DmaBuffer,
        len: usize,
        direction: Direction,
        flags: MapFlags,
    ) -> Result<Plan> {
        if len == 0 {
            return Err(DmaError::ZeroLength);
        }
        if len > buffer.len() {
            return Err(DmaError::InvalidLength {
                len,
                capacity: buffer.len(),
            });
        }
        if len > descriptor.max_transfer {
            self.validator.record(Violations::EXCEEDS_TRANSFER_SIZE);
            return Err(DmaError::ConstraintViolation(Violations::EXCEEDS_TRANSFER_SIZE));
        }

        let forced = flags.contains(MapFlags::FORCE_BOUNCE);
        if !forced && self.shares_cache_lines(descriptor, buffer, len, direction, flags) {
            if flags.contains(MapFlags::NO_BOUNCE) {
                return Err(DmaError::ConstraintViolation(Violations::MISALIGNED));
            }
            log::trace!("dma: {:#x}+{:#x} shares cache lines, bouncing", buffer.virt_addr(), len);
        } else if !forced {
            match self.try_in_place(descriptor, buffer.virt_addr(), len, direction) {
                Ok(plan) => return Ok(plan),
                Err(err) if flags.contains(MapFlags::NO_BOUNCE) => return Err(err),
                Err(err) => {
                    self.counters.record_fallback();
                    log::debug!("dma: {:#x}+{:#x} falls back to bounce: {}", buffer.virt_addr(), len, err);
                }
            }
        }

        self.bounce(descriptor, buffer, len, direction)
    }

    /// A non-coherent device write into a buffer that shares a cache line
    /// with other data loses that data when the line is invalidated.
    fn shares_cache_lines(
        &self,
        descriptor: &ConstraintDescriptor,
        buffer: &DmaBuffer,
        len: usize,
        direction: Direction,
        flags: MapFlags,
    ) -> bool {
        if descriptor.cache_coherent
            || flags.intersects(MapFlags::COHERENT | MapFlags::NO_SYNC)
            || !direction.device_writes()
            || !self.coherency.tier().invalidates()
        {
            return false;
        }
        let line = self.coherency.line_size();
        let start = buffer.virt_addr();
        let end = start + len;
        align_down(start, line) != start || align_up(end, line) != end
    }

    fn try_in_place(
        &mut self,
        descriptor: &ConstraintDescriptor,
        virt: usize,
        len: usize,
        direction: Direction,
    ) -> Result<Plan> {
        let resolution = self.resolver.resolve(virt, len, direction)?;
        let handle = resolution.handle;

        let judged = if resolution.contiguous {
            self.judge_contiguous(descriptor, resolution.phys, len)
        } else {
            self.judge_segments(descriptor, &resolution.segments)
        };

        match judged {
            Ok(segments) => Ok(Plan {
                kind: if handle.is_some() {
                    MappingKind::Translated
                } else {
                    MappingKind::Direct
                },
                segments,
                bounce: None,
                translation: handle,
            }),
            Err(v) => {
                if let Some(handle) = handle {
                    self.release_translation(handle);
                }
                Err(DmaError::ConstraintViolation(v))
            }
        }
    }

    fn judge_contiguous(
        &self,
        descriptor: &ConstraintDescriptor,
        phys: PhysAddr,
        len: usize,
    ) -> core::result::Result<SegmentList, Violations> {
        match self.validator.classify(phys, len, descriptor) {
            Classification::Direct if len <= descriptor.max_segment_size => Ok(SegmentList::single(phys, len)),
            Classification::Direct => {
                validate::split(phys, len, descriptor).map_err(|_| Violations::EXCEEDS_TRANSFER_SIZE)
            }
            Classification::Split(list) => Ok(list),
            Classification::Bounce(v) | Classification::Reject(v) => Err(v),
        }
    }

    /// A translation came back in pieces. Usable only by a scatter-gather
    /// device with room for every piece, and only if every piece validates.
    fn judge_segments(
        &self,
        descriptor: &ConstraintDescriptor,
        segments: &SegmentList,
    ) -> core::result::Result<SegmentList, Violations> {
        if descriptor.requires_contiguous
            || !descriptor.supports_sg()
            || segments.len() > descriptor.max_sg_segments
        {
            self.validator.record(Violations::NOT_CONTIGUOUS);
            return Err(Violations::NOT_CONTIGUOUS);
        }
        let mut v = Violations::empty();
        for seg in segments {
            v |= self.validator.check(seg.addr, seg.len, descriptor);
            if seg.len > descriptor.max_segment_size {
                v |= Violations::EXCEEDS_TRANSFER_SIZE;
            }
        }
        if v.ok() {
            Ok(*segments)
        } else {
            Err(v)
        }
    }

    fn bounce(
        &mut self,
        descriptor: &ConstraintDescriptor,
        buffer: &DmaBuffer,
        len: usize,
        direction: Direction,
    ) -> Result<Plan> {
        let entry_size = self.pools.entry_size();
        if len > entry_size {
            return Err(DmaError::InvalidLength {
                len,
                capacity: entry_size,
            });
        }
        let data = &buffer.as_slice()[..len];
        let (kind, lease) = match direction {
            Direction::ToDevice => (PoolKind::Tx, self.pools.acquire_for_device(data)),
            Direction::FromDevice => (PoolKind::Rx, self.pools.acquire_from_device(len)),
            Direction::Bidirectional => (PoolKind::Tx, self.pools.acquire_bidirectional(data)),
        };
        let lease = lease.ok_or(DmaError::PoolExhausted(kind))?;
        let segments = if len <= descriptor.max_segment_size {
            SegmentList::single(lease.phys(), len)
        } else {
            match validate::split(lease.phys(), len, descriptor) {
                Ok(list) => list,
                Err(err) => {
                    log::debug!("dma: bounce entry {} cannot be described: {}", lease.phys(), err);
                    self.pools.release(lease, &mut []);
                    return Err(DmaError::TooManySegments);
                }
            }
        };
        Ok(Plan {
            kind: MappingKind::Bounced,
            segments,
            bounce: Some(lease),
            translation: None,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &mut self,
        plan: Plan,
        descriptor: &ConstraintDescriptor,
        class: DeviceClassId,
        buffer: DmaBuffer,
        len: usize,
        direction: Direction,
        flags: MapFlags,
    ) -> Mapping {
        let needs_sync =
            !descriptor.cache_coherent && !flags.intersects(MapFlags::COHERENT | MapFlags::NO_SYNC);
        let mapping = Mapping {
            buffer,
            len,
            direction,
            kind: plan.kind,
            class,
            segments: plan.segments,
            bounce: plan.bounce,
            translation: plan.translation,
            flags,
            needs_sync,
        };

        if needs_sync {
            // SAFETY: the mapping owns the memory behind `dma_ptr`.
            unsafe {
                if flags.contains(MapFlags::COALESCE) {
                    self.coherency
                        .sync_for_device_deferred(mapping.dma_ptr(), len, direction);
                } else {
                    self.coherency.sync_for_device(mapping.dma_ptr(), len, direction);
                }
            }
        }

        self.counters.record_map(mapping.kind);
        log::trace!(
            "dma: mapped {:?} {:#x} bytes {:?} at {}",
            mapping.kind,
            len,
            direction,
            mapping.phys_addr()
        );
        mapping
    }

    fn fail(&mut self, error: DmaError, buffer: DmaBuffer) -> MapFailure {
        self.counters.record_error();
        match error {
            DmaError::PoolExhausted(kind) => log::warn!("dma: {:?} bounce pool exhausted", kind),
            _ => log::debug!("dma: map failed: {}", error),
        }
        MapFailure { error, buffer }
    }

    fn release_translation(&mut self, handle: TranslationHandle) {
        if let Err(err) = self.resolver.release(handle) {
            self.counters.record_release_error();
            log::warn!("dma: translation unlock failed: {}", err);
        }
    }
}

impl<T, O, C> Unmap for DmaMapper<T, O, C>
where
    T: TranslationService,
    O: CacheOps,
    C: Clock,
{
    fn unmap(&mut self, mapping: Mapping) -> DmaBuffer {
        if mapping.needs_sync && mapping.direction.device_writes() {
            // SAFETY: the mapping still owns the memory.
            unsafe {
                self.coherency
                    .sync_for_cpu(mapping.dma_ptr(), mapping.len, mapping.direction)
            };
        }

        let Mapping {
            mut buffer,
            len,
            bounce,
            translation,
            ..
        } = mapping;

        if let Some(handle) = translation {
            self.release_translation(handle);
        }
        if let Some(lease) = bounce {
            self.pools.release(lease, &mut buffer.as_mut_slice()[..len]);
        }

        self.counters.record_unmap();
        buffer
    }
}
