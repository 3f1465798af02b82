//! `otlpgw-core` 提供网关数据面的报文内存模型。
//!
//! # 模块定位（Why）
//! - 入站 OTLP 报文在 “接收 → 变更 → 导出 → 释放” 的有界流水线中流转，生命周期短且集中，
//!   适合使用按 slab 整体回收（epoch reset）的碰撞指针分配器，而不是逐块释放的通用堆分配。
//! - 上层的线格式游标、变更规划与重组写入器都只依赖本 crate 的 [`PacketRef`] 与
//!   [`PacketAllocator`] 契约，从而与具体内存策略解耦。
//!
//! # 设计概要（How）
//! - `slab` 模块持有固定容量的原始内存区间，通过单个 `AtomicU64` 同时打包碰撞游标与活跃计数，
//!   分配与释放都是一次 CAS 重试循环，热路径不持有任何互斥锁；
//! - [`PacketRef`] 以 `Arc` 表达引用计数：`Clone` 即 retain，`Drop`/[`PacketRef::release`] 即 release，
//!   最后一个持有者析构时通知所属 slab 递减活跃计数；
//! - [`StripedPacketAllocator`] 以 2 的幂个分片 + 线程亲和键做确定性路由，分片满时直接拒绝，
//!   不跨分片回退，以获得可预测的背压。
//!
//! # 命名约定（Consistency）
//! - 状态码统一使用 [`StatusCode`]，与网关对外的 HTTP 语义保持一致；
//! - 日志统一通过 `tracing` 输出，安装入口位于 [`telemetry`]。

mod allocator;
mod descriptor;
mod packet;
mod slab;
mod status;
mod sync;
pub mod telemetry;

pub use allocator::{
    AllocationDenied, AllocationTag, AllocatorStats, LeaseResult, PacketAllocator,
    SlabPacketAllocator, StripedPacketAllocator, StripingError, current_affinity_key,
};
pub use descriptor::{PacketDescriptor, ProtocolKind, SignalKind};
pub use packet::{OwnershipError, PacketRef};
pub use status::StatusCode;
