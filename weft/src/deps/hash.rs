//! Dependency records, record stacks, and the fixed-width dependency hash.
//!
//! One node type serves the hash buckets, the two remote staging lists and
//! the per-task remote successor stacks; nodes circulate through a shared
//! free list.

use crate::gptr::GlobalPtr;
use crate::remote::RemoteToken;
use crate::task::{RegionDep, TaskRef};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Number of buckets. Fixed at compile time; only distribution quality
/// depends on the value since buckets are rebuilt every epoch.
pub(crate) const DEPHASH_SIZE: usize = 1024;

/// Bucket index for a region address.
///
/// Pointers are at least 8-byte aligned, so the low three bits are folded
/// away; the Marsaglia shift-xor triplet (7, 11, 17) spreads the rest.
pub(crate) fn hash_gptr(gptr: &GlobalPtr) -> usize {
    let off = gptr.offset >> 3;
    ((off ^ (off >> 7) ^ (off >> 11) ^ (off >> 17)) % DEPHASH_SIZE as u64) as usize
}

/// The task a dependency record refers to: a local record, or the opaque
/// token of a task living on another participant.
#[derive(Clone)]
pub(crate) enum DepTarget {
    Local(TaskRef),
    Remote(RemoteToken),
}

impl DepTarget {
    pub(crate) fn local(&self) -> Option<&TaskRef> {
        match self {
            DepTarget::Local(task) => Some(task),
            DepTarget::Remote(_) => None,
        }
    }
}

/// One entry in the dependency hash or in a staging list.
#[derive(Clone)]
pub(crate) struct DepRecord {
    pub(crate) target: DepTarget,
    pub(crate) dep: RegionDep,
    /// Phase in which the dependency was observed.
    pub(crate) phase: u64,
}

pub(crate) struct DepNode {
    rec: Option<DepRecord>,
    next: Option<Box<DepNode>>,
}

/// LIFO stack of dependency records; newest record at the head.
pub(crate) struct DepStack {
    head: Option<Box<DepNode>>,
}

impl DepStack {
    pub(crate) const fn new() -> Self {
        Self { head: None }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub(crate) fn push(&mut self, mut node: Box<DepNode>) {
        node.next = self.head.take();
        self.head = Some(node);
    }

    /// Pop the newest node; the record stays inside for the caller to take.
    pub(crate) fn pop_node(&mut self) -> Option<Box<DepNode>> {
        let mut node = self.head.take()?;
        self.head = node.next.take();
        Some(node)
    }

    /// Detach the whole stack, leaving this one empty.
    pub(crate) fn take_all(&mut self) -> DepStack {
        DepStack {
            head: self.head.take(),
        }
    }

    /// Newest-first traversal.
    pub(crate) fn iter(&self) -> DepStackIter<'_> {
        DepStackIter {
            node: self.head.as_deref(),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.iter().count()
    }
}

pub(crate) struct DepStackIter<'a> {
    node: Option<&'a DepNode>,
}

impl<'a> Iterator for DepStackIter<'a> {
    type Item = &'a DepRecord;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.node?;
        self.node = node.next.as_deref();
        node.rec.as_ref()
    }
}

impl DepNode {
    pub(crate) fn record(&self) -> Option<&DepRecord> {
        self.rec.as_ref()
    }

    /// Take the record out, leaving the node ready for recycling.
    pub(crate) fn take(&mut self) -> Option<DepRecord> {
        self.rec.take()
    }
}

/// Process-wide free list of dependency nodes with double-checked
/// allocation, mirroring the successor-node pool.
pub(crate) struct DepPool {
    free: Mutex<Option<Box<DepNode>>>,
    approx_len: AtomicUsize,
}

impl DepPool {
    pub(crate) const fn new() -> Self {
        Self {
            free: Mutex::new(None),
            approx_len: AtomicUsize::new(0),
        }
    }

    pub(crate) fn allocate(&self, rec: DepRecord) -> Box<DepNode> {
        let mut node = None;
        if self.approx_len.load(Ordering::Relaxed) > 0 {
            let mut free = self.free.lock();
            if let Some(mut head) = free.take() {
                *free = head.next.take();
                self.approx_len.fetch_sub(1, Ordering::Relaxed);
                node = Some(head);
            }
        }

        match node {
            Some(mut node) => {
                node.rec = Some(rec);
                node
            }
            None => Box::new(DepNode {
                rec: Some(rec),
                next: None,
            }),
        }
    }

    pub(crate) fn recycle(&self, mut node: Box<DepNode>) {
        node.rec = None;
        let mut free = self.free.lock();
        node.next = free.take();
        *free = Some(node);
        self.approx_len.fetch_add(1, Ordering::Relaxed);
    }

    /// Recycle every node of `stack`.
    pub(crate) fn recycle_all(&self, mut stack: DepStack) {
        while let Some(node) = stack.pop_node() {
            self.recycle(node);
        }
    }

    /// Drop the pooled nodes themselves. Iterative for the same reason as
    /// the successor-node pool.
    pub(crate) fn fini(&self) {
        let mut free = self.free.lock();
        let mut head = free.take();
        while let Some(mut node) = head {
            head = node.next.take();
        }
        self.approx_len.store(0, Ordering::Relaxed);
    }
}

impl Drop for DepPool {
    fn drop(&mut self) {
        self.fini();
    }
}

/// The fixed array of bucket heads. Guarded by the resolver's table mutex.
pub(crate) struct DepTable {
    pub(crate) buckets: Vec<DepStack>,
}

impl DepTable {
    pub(crate) fn new() -> Self {
        Self {
            buckets: (0..DEPHASH_SIZE).map(|_| DepStack::new()).collect(),
        }
    }

    /// Recycle every record in every bucket.
    pub(crate) fn reset(&mut self, pool: &DepPool) {
        for bucket in &mut self.buckets {
            pool.recycle_all(bucket.take_all());
        }
    }

    #[cfg(test)]
    pub(crate) fn record_count(&self) -> usize {
        self.buckets.iter().map(DepStack::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gptr::UnitId;
    use crate::task::{DepKind, Task};
    use rstest::rstest;

    fn record(offset: u64, kind: DepKind) -> DepRecord {
        DepRecord {
            target: DepTarget::Local(Task::blank()),
            dep: RegionDep::new(kind, GlobalPtr::new(UnitId(0), offset)),
            phase: 0,
        }
    }

    #[rstest]
    #[case::aligned_base(0x1000)]
    #[case::large(0xdead_beef_0000)]
    #[case::small(8)]
    fn hash_matches_the_marsaglia_fold(#[case] offset: u64) {
        let off = offset >> 3;
        let expected = ((off ^ (off >> 7) ^ (off >> 11) ^ (off >> 17)) % DEPHASH_SIZE as u64) as usize;
        assert_eq!(hash_gptr(&GlobalPtr::new(UnitId(0), offset)), expected);
        assert!(hash_gptr(&GlobalPtr::new(UnitId(0), offset)) < DEPHASH_SIZE);
    }

    #[test]
    fn stack_iterates_newest_first() {
        let pool = DepPool::new();
        let mut stack = DepStack::new();
        stack.push(pool.allocate(record(8, DepKind::In)));
        stack.push(pool.allocate(record(16, DepKind::Out)));

        let offsets: Vec<u64> = stack.iter().map(|r| r.dep.gptr.offset).collect();
        assert_eq!(offsets, vec![16, 8]);
        assert_eq!(stack.len(), 2);
    }

    #[test]
    fn reset_recycles_into_the_pool() {
        let pool = DepPool::new();
        let mut table = DepTable::new();

        let gptr = GlobalPtr::new(UnitId(0), 0x40);
        let slot = hash_gptr(&gptr);
        table.buckets[slot].push(pool.allocate(record(0x40, DepKind::Out)));
        assert_eq!(table.record_count(), 1);

        table.reset(&pool);
        assert_eq!(table.record_count(), 0);

        // The recycled node is reused by the next allocation.
        let node = pool.allocate(record(0x48, DepKind::In));
        assert_eq!(pool.approx_len.load(Ordering::Relaxed), 0);
        pool.recycle(node);
        assert_eq!(pool.approx_len.load(Ordering::Relaxed), 1);
    }
}
