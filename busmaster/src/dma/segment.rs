//! Physical segment lists.

use core::fmt;

use dma_pool::PhysAddr;

/// Capacity of a [`SegmentList`].
pub const MAX_SEGMENTS: usize = 16;

/// One physically contiguous run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Segment {
    pub addr: PhysAddr,
    pub len: usize,
}

impl Segment {
    pub const fn new(addr: PhysAddr, len: usize) -> Self {
        Self { addr, len }
    }
}

/// Fixed-capacity list of segments, in transfer order.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SegmentList {
    segs: [Segment; MAX_SEGMENTS],
    count: usize,
}

impl SegmentList {
    pub const fn new() -> Self {
        Self {
            segs: [Segment::new(PhysAddr::ZERO, 0); MAX_SEGMENTS],
            count: 0,
        }
    }

    pub fn single(addr: PhysAddr, len: usize) -> Self {
        let mut list = Self::new();
        list.segs[0] = Segment::new(addr, len);
        list.count = 1;
        list
    }

    /// Append a segment. Gives it back when the list is full.
    pub fn push(&mut self, seg: Segment) -> Result<(), Segment> {
        if self.count == MAX_SEGMENTS {
            return Err(seg);
        }
        self.segs[self.count] = seg;
        self.count += 1;
        Ok(())
    }

    pub fn as_slice(&self) -> &[Segment] {
        &self.segs[..self.count]
    }

    pub fn iter(&self) -> core::slice::Iter<'_, Segment> {
        self.as_slice().iter()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn first(&self) -> Option<&Segment> {
        self.as_slice().first()
    }

    /// Sum of segment lengths.
    pub fn total_len(&self) -> usize {
        self.iter().map(|s| s.len).sum()
    }
}

impl Default for SegmentList {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> IntoIterator for &'a SegmentList {
    type Item = &'a Segment;
    type IntoIter = core::slice::Iter<'a, Segment>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Debug for SegmentList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.iter().map(|s| (s.addr, s.len)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_until_full() {
        let mut list = SegmentList::new();
        for i in 0..MAX_SEGMENTS {
            list.push(Segment::new(PhysAddr::new(i as u64 * 0x1000), 0x100)).unwrap();
        }
        let extra = Segment::new(PhysAddr::new(0xF000_0000), 1);
        assert_eq!(list.push(extra), Err(extra));
        assert_eq!(list.len(), MAX_SEGMENTS);
        assert_eq!(list.total_len(), MAX_SEGMENTS * 0x100);
    }

    #[test]
    fn test_single() {
        let list = SegmentList::single(PhysAddr::new(0x2000), 64);
        assert_eq!(list.len(), 1);
        assert_eq!(list.first(), Some(&Segment::new(PhysAddr::new(0x2000), 64)));
    }

    #[test]
    fn test_debug_lists_only_used_segments() {
        let mut list = SegmentList::single(PhysAddr::new(0x2000), 64);
        list.push(Segment::new(PhysAddr::new(0x9000), 0x20)).unwrap();
        assert_eq!(
            format!("{:?}", list),
            "[(PhysAddr(0x2000), 64), (PhysAddr(0x9000), 32)]"
        );
    }
}
