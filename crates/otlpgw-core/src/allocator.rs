use std::sync::Arc;

use thiserror::Error;

use crate::descriptor::{PacketDescriptor, ProtocolKind, SignalKind};
use crate::packet::PacketRef;
use crate::slab::{AllocatorMetrics, SlabRegion, align_up};
use crate::status::StatusCode;
use crate::sync::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// 分配结果：成功时调用方拥有返回的 [`PacketRef`]。
pub type LeaseResult = Result<PacketRef, AllocationDenied>;

/// 分配被拒绝的原因。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum AllocationDenied {
    /// 所有可用 slab 都没有足够的剩余容量（或请求本身超过单个 slab 容量）。
    #[error("no slab can hold {requested} bytes")]
    InsufficientStorage { requested: usize },
    /// 分配器已经关闭。
    #[error("allocator is closed")]
    Closed,
}

impl AllocationDenied {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InsufficientStorage { .. } => StatusCode::InsufficientStorage,
            Self::Closed => StatusCode::ServiceUnavailable,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InsufficientStorage { .. } => "alloc.insufficient_storage",
            Self::Closed => "alloc.closed",
        }
    }
}

/// 分配标签：标识调用组件与用途，同时决定新报文的信号种类。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AllocationTag {
    pub component: &'static str,
    pub purpose: &'static str,
    pub signal: SignalKind,
}

impl AllocationTag {
    pub const fn new(component: &'static str, purpose: &'static str, signal: SignalKind) -> Self {
        Self {
            component,
            purpose,
            signal,
        }
    }
}

/// 分配器统计快照。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AllocatorStats {
    pub alloc_count: u64,
    pub release_count: u64,
    /// 各 slab 碰撞游标之和，即尚未被 epoch reset 回收的字节数。
    pub in_use_bytes: u64,
    pub failed_allocations: u64,
}

impl AllocatorStats {
    fn merge(self, other: Self) -> Self {
        Self {
            alloc_count: self.alloc_count + other.alloc_count,
            release_count: self.release_count + other.release_count,
            in_use_bytes: self.in_use_bytes + other.in_use_bytes,
            failed_allocations: self.failed_allocations + other.failed_allocations,
        }
    }
}

/// 报文缓冲分配契约。
///
/// # 契约说明（What）
/// - **线程安全**：实现必须满足 `Send + Sync`，可被多个接入线程并发调用；
/// - **后置条件**：`allocate` 成功返回的报文长度等于 `min_bytes`，底层预留按 8 字节对齐；
/// - **关闭**：`close` 之后的分配一律返回 [`AllocationDenied::Closed`]；关闭时仍有未归还的租约不会报错，
///   只记录告警，内存在最后一个租约析构后才真正归还。
pub trait PacketAllocator: Send + Sync {
    fn allocate(&self, min_bytes: usize, tag: AllocationTag) -> LeaseResult;

    fn stats(&self) -> AllocatorStats;

    fn close(&self);
}

/// 基于碰撞指针 + epoch reset 的 slab 分配器。
///
/// # 核心机制（How）
/// - 持有 N 个等容量 slab，始终在“当前” slab 上分配；当前 slab 放不下时按轮转顺序尝试后续 slab，
///   并把成功的 slab 记为新的当前位置；
/// - 全部 slab 都在排空（游标 > 0 且放不下）时拒绝，返回 `InsufficientStorage`；
/// - 每次分配都是一次 CAS，不加锁、不维护自由链表。
///
/// # 设计权衡（Trade-offs）
/// - 只适合生命周期短且集中的报文：一个长期不释放的报文会让整个 slab 无法回收；
/// - 请求超过单个 slab 容量时直接拒绝，而不是退化为堆分配，以免掩盖容量配置问题。
pub struct SlabPacketAllocator {
    slabs: Box<[Arc<SlabRegion>]>,
    current: AtomicUsize,
    closed: AtomicBool,
    packet_ids: AtomicU64,
    metrics: Arc<AllocatorMetrics>,
}

impl SlabPacketAllocator {
    /// 单 slab 分配器。
    pub fn new(slab_bytes: usize) -> Self {
        Self::with_slabs(slab_bytes, 1)
    }

    /// `slab_count` 个容量为 `slab_bytes` 的 slab；`slab_count` 为 0 时按 1 处理，
    /// 超过 `u32::MAX` 的容量被截断。
    pub fn with_slabs(slab_bytes: usize, slab_count: usize) -> Self {
        let capacity = u32::try_from(slab_bytes).unwrap_or(u32::MAX);
        let metrics = Arc::new(AllocatorMetrics::new());
        let slabs = (0..slab_count.max(1))
            .map(|index| Arc::new(SlabRegion::new(index, capacity, Arc::clone(&metrics))))
            .collect();
        Self {
            slabs,
            current: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            packet_ids: AtomicU64::new(1),
            metrics,
        }
    }

    pub fn slab_count(&self) -> usize {
        self.slabs.len()
    }

    pub fn slab_capacity(&self) -> usize {
        self.slabs[0].capacity() as usize
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 仍被租约占用的 slab 分配数量之和。
    pub fn outstanding(&self) -> u64 {
        self.slabs.iter().map(|slab| u64::from(slab.active())).sum()
    }

    fn deny(&self, denied: AllocationDenied) -> LeaseResult {
        self.metrics
            .failed_allocations
            .fetch_add(1, Ordering::Relaxed);
        Err(denied)
    }
}

impl PacketAllocator for SlabPacketAllocator {
    fn allocate(&self, min_bytes: usize, tag: AllocationTag) -> LeaseResult {
        if self.is_closed() {
            return self.deny(AllocationDenied::Closed);
        }
        let Some(aligned) = align_up(min_bytes) else {
            return self.deny(AllocationDenied::InsufficientStorage {
                requested: min_bytes,
            });
        };

        let count = self.slabs.len();
        let start = self.current.load(Ordering::Relaxed) % count;
        for step in 0..count {
            let index = (start + step) % count;
            let Some(lease) = self.slabs[index].try_reserve(aligned) else {
                continue;
            };
            if step > 0 {
                self.current.store(index, Ordering::Relaxed);
            }
            self.metrics.alloc_count.fetch_add(1, Ordering::Relaxed);
            let descriptor = PacketDescriptor::new(
                self.packet_ids.fetch_add(1, Ordering::Relaxed),
                0,
                tag.signal,
                ProtocolKind::Unknown,
            );
            return Ok(PacketRef::from_lease(lease, min_bytes, descriptor));
        }

        tracing::debug!(
            requested = min_bytes,
            component = tag.component,
            purpose = tag.purpose,
            "all slabs draining, allocation denied"
        );
        self.deny(AllocationDenied::InsufficientStorage {
            requested: min_bytes,
        })
    }

    fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            alloc_count: self.metrics.alloc_count.load(Ordering::Relaxed),
            release_count: self.metrics.release_count.load(Ordering::Relaxed),
            in_use_bytes: self
                .slabs
                .iter()
                .map(|slab| u64::from(slab.cursor()))
                .sum(),
            failed_allocations: self.metrics.failed_allocations.load(Ordering::Relaxed),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let outstanding = self.outstanding();
        if outstanding > 0 {
            let slabs: Vec<usize> = self
                .slabs
                .iter()
                .filter(|slab| slab.active() > 0)
                .map(|slab| slab.index())
                .collect();
            tracing::warn!(
                outstanding,
                ?slabs,
                "closing slab allocator with outstanding leases; memory is returned when they drop"
            );
        }
    }
}

/// 分片构造失败。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum StripingError {
    #[error("shard count {0} is not a power of two")]
    ShardCountNotPowerOfTwo(usize),
}

/// 按线程亲和键做确定性路由的分片分配器。
///
/// - 分片数必须是 2 的幂，路由为 `affinity_key & (shards - 1)`；
/// - 某个分片满时立即拒绝，不在其它分片上重试，使背压可预测。
pub struct StripedPacketAllocator {
    shards: Box<[SlabPacketAllocator]>,
    mask: usize,
}

impl StripedPacketAllocator {
    pub fn new(
        shard_count: usize,
        slab_bytes: usize,
        slabs_per_shard: usize,
    ) -> Result<Self, StripingError> {
        if !shard_count.is_power_of_two() {
            return Err(StripingError::ShardCountNotPowerOfTwo(shard_count));
        }
        let shards = (0..shard_count)
            .map(|_| SlabPacketAllocator::with_slabs(slab_bytes, slabs_per_shard))
            .collect();
        Ok(Self {
            shards,
            mask: shard_count - 1,
        })
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// 亲和键到分片下标的映射。
    pub fn shard_for(&self, affinity_key: usize) -> usize {
        affinity_key & self.mask
    }

    /// 以显式亲和键分配，便于调用方把同一连接固定到同一分片。
    pub fn allocate_with_affinity(
        &self,
        affinity_key: usize,
        min_bytes: usize,
        tag: AllocationTag,
    ) -> LeaseResult {
        self.shards[self.shard_for(affinity_key)].allocate(min_bytes, tag)
    }

    pub fn shard_stats(&self, shard: usize) -> Option<AllocatorStats> {
        self.shards.get(shard).map(PacketAllocator::stats)
    }
}

impl PacketAllocator for StripedPacketAllocator {
    fn allocate(&self, min_bytes: usize, tag: AllocationTag) -> LeaseResult {
        self.allocate_with_affinity(current_affinity_key(), min_bytes, tag)
    }

    fn stats(&self) -> AllocatorStats {
        self.shards
            .iter()
            .map(PacketAllocator::stats)
            .fold(AllocatorStats::default(), AllocatorStats::merge)
    }

    fn close(&self) {
        for shard in self.shards.iter() {
            shard.close();
        }
    }
}

// 亲和键只需在线程内稳定，进程级计数器即可；不参与 loom 模型。
static NEXT_AFFINITY_KEY: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

thread_local! {
    static AFFINITY_KEY: usize =
        NEXT_AFFINITY_KEY.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
}

/// 当前线程的稳定亲和键：同一线程多次调用返回同一个值。
pub fn current_affinity_key() -> usize {
    AFFINITY_KEY.with(|key| *key)
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    const TAG: AllocationTag = AllocationTag::new("test", "unit", SignalKind::Metrics);

    #[test]
    fn allocation_carries_tag_signal_and_requested_length() {
        let allocator = SlabPacketAllocator::new(64);
        let packet = allocator.allocate(5, TAG).expect("granted");
        assert_eq!(packet.length(), 5);
        assert_eq!(packet.region().len(), 8);
        assert_eq!(packet.descriptor().signal, SignalKind::Metrics);
        assert_eq!(allocator.stats().in_use_bytes, 8);
    }

    #[test]
    fn multi_slab_rotates_when_current_is_full() {
        let allocator = SlabPacketAllocator::with_slabs(16, 2);
        let a = allocator.allocate(16, TAG).expect("slab 0");
        let b = allocator.allocate(16, TAG).expect("slab 1");
        let denied = allocator.allocate(1, TAG).unwrap_err();
        assert_eq!(denied.status(), StatusCode::InsufficientStorage);
        drop(a);
        let c = allocator.allocate(8, TAG).expect("slab 0 reclaimed");
        assert_eq!(allocator.stats().in_use_bytes, 24);
        drop((b, c));
        assert_eq!(allocator.stats().in_use_bytes, 0);
    }

    #[test]
    #[tracing_test::traced_test]
    fn close_with_outstanding_leases_warns_and_denies() {
        let allocator = SlabPacketAllocator::new(64);
        let held = allocator.allocate(10, TAG).expect("granted");
        allocator.close();
        allocator.close();
        assert!(logs_contain("outstanding leases"));
        assert_eq!(
            allocator.allocate(1, TAG).unwrap_err(),
            AllocationDenied::Closed
        );
        assert_eq!(AllocationDenied::Closed.status(), StatusCode::ServiceUnavailable);
        // 关闭后仍持有的报文依然可读，析构时正常归还。
        assert_eq!(held.payload().len(), 10);
        drop(held);
        assert_eq!(allocator.stats().in_use_bytes, 0);
        assert_eq!(allocator.stats().failed_allocations, 1);
    }

    #[test]
    fn striped_rejects_non_power_of_two() {
        assert_eq!(
            StripedPacketAllocator::new(3, 64, 1).err(),
            Some(StripingError::ShardCountNotPowerOfTwo(3))
        );
    }

    #[test]
    fn affinity_key_is_stable_per_thread() {
        let here = current_affinity_key();
        assert_eq!(here, current_affinity_key());
        let other = std::thread::spawn(current_affinity_key)
            .join()
            .expect("thread");
        assert_ne!(here, other);
    }
}
