// `loom` 需要接管原子操作以枚举调度交错，因此在 `--cfg loom` 下切换到它提供的原子类型；
// `Arc` 保持标准实现，`PacketRef` 依赖其 `get_mut`/`into_inner` 语义。
#[cfg(not(loom))]
pub(crate) use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

#[cfg(loom)]
pub(crate) use loom::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
