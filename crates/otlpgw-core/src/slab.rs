//! 固定容量 slab 区间与其租约。
//!
//! # 核心机制（How）
//! - 每个 slab 用一个 `AtomicU64` 打包 `(cursor << 32) | active`：分配是一次 CAS，同时推进碰撞游标并递增
//!   活跃计数；释放也是一次 CAS，递减活跃计数，若归零则在**同一次** CAS 中把游标复位为 0（epoch reset）。
//!   两个字段在同一原子字内变化，不存在“计数已归零但游标尚未复位”时被新分配插入的窗口。
//! - 没有自由链表：部分释放不会回收游标，只有整个 slab 的活跃计数归零时才整体回收。
//!
//! # 内存别名（Safety）
//! - slab 的底层内存来自 `Box<[u8]>`，以裸指针持有，从不创建覆盖整个区间的引用；
//! - 每个 [`SlabLease`] 独占 `[start, start + reserved)`，在该租约析构之前，这段区间不会被再次分配
//!   （游标只有在活跃计数归零后才复位，而本租约本身计入活跃计数）；
//! - 可变访问只能通过 `&mut SlabLease` 获得，调用方（`PacketRef`）只有在引用计数唯一时才能拿到它。

use std::{ptr, ptr::NonNull, sync::Arc};

use crate::sync::{AtomicU64, Ordering};

/// 分配粒度：请求长度向上取整到 8 字节。
pub(crate) const ALIGNMENT: usize = 8;

/// 将请求长度按 [`ALIGNMENT`] 向上取整；0 字节请求按一个对齐单位处理，
/// 保证“活跃计数 > 0 时游标必然 > 0”。
pub(crate) fn align_up(min_bytes: usize) -> Option<u32> {
    let requested = min_bytes.max(1);
    let aligned = requested.checked_add(ALIGNMENT - 1)? & !(ALIGNMENT - 1);
    u32::try_from(aligned).ok()
}

#[inline]
fn pack(cursor: u32, active: u32) -> u64 {
    (u64::from(cursor) << 32) | u64::from(active)
}

#[inline]
fn unpack(state: u64) -> (u32, u32) {
    ((state >> 32) as u32, state as u32)
}

/// 分配器级别的累计计数，由所有 slab 共享。
pub(crate) struct AllocatorMetrics {
    pub(crate) alloc_count: AtomicU64,
    pub(crate) release_count: AtomicU64,
    pub(crate) failed_allocations: AtomicU64,
}

impl AllocatorMetrics {
    pub(crate) fn new() -> Self {
        Self {
            alloc_count: AtomicU64::new(0),
            release_count: AtomicU64::new(0),
            failed_allocations: AtomicU64::new(0),
        }
    }
}

pub(crate) struct SlabRegion {
    index: usize,
    base: NonNull<u8>,
    capacity: u32,
    state: AtomicU64,
    metrics: Arc<AllocatorMetrics>,
}

// SAFETY: `base` 指向的内存由本结构独占拥有，并发访问按上文约定拆分为互不重叠的租约区间；
// 共享状态只有原子字 `state`。
unsafe impl Send for SlabRegion {}
// SAFETY: 同上，`&SlabRegion` 只暴露原子操作与只读元数据。
unsafe impl Sync for SlabRegion {}

impl SlabRegion {
    pub(crate) fn new(index: usize, capacity: u32, metrics: Arc<AllocatorMetrics>) -> Self {
        let storage = vec![0u8; capacity as usize].into_boxed_slice();
        let base = NonNull::from(Box::leak(storage)).cast::<u8>();
        Self {
            index,
            base,
            capacity,
            state: AtomicU64::new(0),
            metrics,
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn capacity(&self) -> u32 {
        self.capacity
    }

    /// 当前碰撞游标，即已被占用（尚未整体回收）的字节数。
    pub(crate) fn cursor(&self) -> u32 {
        unpack(self.state.load(Ordering::Acquire)).0
    }

    pub(crate) fn active(&self) -> u32 {
        unpack(self.state.load(Ordering::Acquire)).1
    }

    /// 尝试在本 slab 上预留 `aligned` 字节；容量不足时返回 `None`。
    pub(crate) fn try_reserve(self: &Arc<Self>, aligned: u32) -> Option<SlabLease> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let (cursor, active) = unpack(current);
            let end = cursor.checked_add(aligned)?;
            if end > self.capacity || active == u32::MAX {
                return None;
            }
            match self.state.compare_exchange_weak(
                current,
                pack(end, active + 1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(SlabLease {
                        slab: Arc::clone(self),
                        start: cursor,
                        reserved: aligned,
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// 递减活跃计数；返回 `true` 表示本次释放触发了 epoch reset。
    fn release_one(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let (cursor, active) = unpack(current);
            debug_assert!(active > 0, "slab {} released more leases than granted", self.index);
            let next = if active <= 1 {
                pack(0, 0)
            } else {
                pack(cursor, active - 1)
            };
            match self.state.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return active <= 1,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Drop for SlabRegion {
    fn drop(&mut self) {
        // SAFETY: `base` 与 `capacity` 正是 `new` 中泄漏的 `Box<[u8]>`，且此时已无任何租约存活
        // （每个租约都持有本结构的 `Arc`）。
        unsafe {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                self.base.as_ptr(),
                self.capacity as usize,
            )));
        }
    }
}

/// 一段已预留的 slab 区间，析构时归还活跃计数。
pub(crate) struct SlabLease {
    slab: Arc<SlabRegion>,
    start: u32,
    reserved: u32,
}

impl SlabLease {
    pub(crate) fn reserved(&self) -> u32 {
        self.reserved
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        // SAFETY: `[start, start + reserved)` 位于 slab 容量之内（`try_reserve` 已校验），
        // 且在本租约存活期间不会被再次分配；只读引用可与其它只读引用共存。
        unsafe {
            core::slice::from_raw_parts(
                self.slab.base.as_ptr().add(self.start as usize),
                self.reserved as usize,
            )
        }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: 同 `as_slice`；`&mut self` 保证本租约区间上不存在其它引用。
        unsafe {
            core::slice::from_raw_parts_mut(
                self.slab.base.as_ptr().add(self.start as usize),
                self.reserved as usize,
            )
        }
    }
}

impl Drop for SlabLease {
    fn drop(&mut self) {
        self.slab
            .metrics
            .release_count
            .fetch_add(1, Ordering::Relaxed);
        if self.slab.release_one() {
            tracing::trace!(slab = self.slab.index, "slab drained, epoch reset");
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn region(capacity: u32) -> Arc<SlabRegion> {
        Arc::new(SlabRegion::new(0, capacity, Arc::new(AllocatorMetrics::new())))
    }

    #[test]
    fn align_up_rounds_to_eight_bytes() {
        assert_eq!(align_up(0), Some(8));
        assert_eq!(align_up(1), Some(8));
        assert_eq!(align_up(8), Some(8));
        assert_eq!(align_up(9), Some(16));
        assert_eq!(align_up(usize::MAX), None);
    }

    #[test]
    fn leases_are_disjoint_and_bump_the_cursor() {
        let slab = region(64);
        let mut first = slab.try_reserve(16).expect("first lease");
        let mut second = slab.try_reserve(8).expect("second lease");
        assert_eq!(slab.cursor(), 24);
        assert_eq!(slab.active(), 2);

        first.as_mut_slice().fill(0xAA);
        second.as_mut_slice().fill(0xBB);
        assert!(first.as_slice().iter().all(|b| *b == 0xAA));
        assert!(second.as_slice().iter().all(|b| *b == 0xBB));
    }

    #[test]
    fn cursor_resets_only_when_last_lease_drops() {
        let slab = region(32);
        let a = slab.try_reserve(16).expect("lease a");
        let b = slab.try_reserve(16).expect("lease b");
        assert!(slab.try_reserve(8).is_none(), "slab should be full");

        drop(a);
        assert_eq!(slab.cursor(), 32, "partial release must not shrink the cursor");
        drop(b);
        assert_eq!(slab.cursor(), 0);
        assert_eq!(slab.active(), 0);
        assert!(slab.try_reserve(32).is_some());
    }
}
