use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::descriptor::PacketDescriptor;
use crate::slab::SlabLease;

/// 访问 [`PacketRef`] 时违反所有权约束的错误。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum OwnershipError {
    /// 需要独占访问，但仍有其它持有者。
    #[error("packet is shared by {holders} holders, exclusive access required")]
    Shared { holders: usize },
    /// 报文包装的是外部只读缓冲，不允许原地修改。
    #[error("packet wraps a read-only external buffer")]
    ReadOnly,
    /// 请求的视图超出了底层区间。
    #[error("view [{offset}, {offset}+{length}) exceeds region of {region} bytes")]
    OutOfRange {
        offset: usize,
        length: usize,
        region: usize,
    },
}

impl OwnershipError {
    /// 稳定错误码，供日志与上层映射使用。
    pub fn code(&self) -> &'static str {
        match self {
            Self::Shared { .. } => "packet.shared",
            Self::ReadOnly => "packet.read_only",
            Self::OutOfRange { .. } => "packet.out_of_range",
        }
    }
}

/// 报文在底层区间中的零拷贝视图，携带引用计数。
///
/// # 设计初衷（Why）
/// - 报文从接入、变更到导出都在同一块内存上流转，只有重组（reframe）才会分配新缓冲；
/// - 引用计数直接映射到 `Arc`：`Clone` 即 retain，`Drop` 即 release，最后一次 release
///   把区间归还给所属 slab。`release` 消耗句柄本身，因此不存在“对已归零的句柄再次 release”的可能。
///
/// # 契约定义（What）
/// - [`region`](Self::region) 返回本报文可见的完整底层字节，[`offset`](Self::offset)/[`length`](Self::length)
///   在其中定位载荷；
/// - 只读访问随时可用；[`payload_mut`](Self::payload_mut) 等可变访问要求当前句柄是唯一持有者，
///   否则返回 [`OwnershipError::Shared`]；
/// - `PacketRef: Send + Sync`，可跨线程移交，但同一时刻只有唯一持有者能修改内容。
#[derive(Clone)]
pub struct PacketRef {
    inner: Arc<PacketInner>,
}

struct PacketInner {
    descriptor: PacketDescriptor,
    offset: usize,
    length: usize,
    storage: Storage,
}

enum Storage {
    Slab(SlabLease),
    Owned(Box<[u8]>),
    Shared(Bytes),
}

impl Storage {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Slab(lease) => lease.as_slice(),
            Self::Owned(buf) => &buf[..],
            Self::Shared(bytes) => &bytes[..],
        }
    }

    fn as_mut_slice(&mut self) -> Result<&mut [u8], OwnershipError> {
        match self {
            Self::Slab(lease) => Ok(lease.as_mut_slice()),
            Self::Owned(buf) => Ok(&mut buf[..]),
            Self::Shared(_) => Err(OwnershipError::ReadOnly),
        }
    }
}

impl PacketRef {
    pub(crate) fn from_lease(lease: SlabLease, length: usize, descriptor: PacketDescriptor) -> Self {
        debug_assert!(length <= lease.reserved() as usize);
        Self::from_storage(Storage::Slab(lease), 0, length, descriptor)
    }

    fn from_storage(
        storage: Storage,
        offset: usize,
        length: usize,
        descriptor: PacketDescriptor,
    ) -> Self {
        Self {
            inner: Arc::new(PacketInner {
                descriptor,
                offset,
                length,
                storage,
            }),
        }
    }

    /// 包装一块外部拥有的可写缓冲，载荷即整个缓冲。
    pub fn wrap(buffer: impl Into<Vec<u8>>, descriptor: PacketDescriptor) -> Self {
        let boxed = buffer.into().into_boxed_slice();
        let length = boxed.len();
        Self::from_storage(Storage::Owned(boxed), 0, length, descriptor)
    }

    /// 包装外部缓冲，并只把 `[offset, offset + length)` 视为载荷（例如跳过传输层帧头）。
    pub fn wrap_view(
        buffer: impl Into<Vec<u8>>,
        offset: usize,
        length: usize,
        descriptor: PacketDescriptor,
    ) -> Result<Self, OwnershipError> {
        let boxed = buffer.into().into_boxed_slice();
        check_view(offset, length, boxed.len())?;
        Ok(Self::from_storage(Storage::Owned(boxed), offset, length, descriptor))
    }

    /// 包装只读的 `Bytes`，零拷贝但不支持原地掩码。
    pub fn wrap_bytes(bytes: Bytes, descriptor: PacketDescriptor) -> Self {
        let length = bytes.len();
        Self::from_storage(Storage::Shared(bytes), 0, length, descriptor)
    }

    pub fn descriptor(&self) -> &PacketDescriptor {
        &self.inner.descriptor
    }

    /// 载荷在 [`region`](Self::region) 中的起始偏移。
    pub fn offset(&self) -> usize {
        self.inner.offset
    }

    pub fn length(&self) -> usize {
        self.inner.length
    }

    pub fn is_empty(&self) -> bool {
        self.inner.length == 0
    }

    /// 本报文可见的完整底层字节。
    pub fn region(&self) -> &[u8] {
        self.inner.storage.as_slice()
    }

    pub fn payload(&self) -> &[u8] {
        let inner = &*self.inner;
        &inner.storage.as_slice()[inner.offset..inner.offset + inner.length]
    }

    /// 当前持有者数量。
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// 是否为唯一持有者。
    pub fn is_exclusive(&self) -> bool {
        Arc::strong_count(&self.inner) == 1
    }

    /// 增加一个持有者，等价于 `clone`。
    #[must_use]
    pub fn retain(&self) -> Self {
        self.clone()
    }

    /// 放弃本句柄；返回 `true` 表示这是最后一个持有者，底层区间已归还。
    pub fn release(self) -> bool {
        Arc::into_inner(self.inner).is_some()
    }

    /// 可变载荷，要求独占。
    pub fn payload_mut(&mut self) -> Result<&mut [u8], OwnershipError> {
        let inner = self.exclusive()?;
        let (offset, length) = (inner.offset, inner.length);
        let region = inner.storage.as_mut_slice()?;
        Ok(&mut region[offset..offset + length])
    }

    /// 可变的完整底层字节，要求独占。
    pub fn region_mut(&mut self) -> Result<&mut [u8], OwnershipError> {
        self.exclusive()?.storage.as_mut_slice()
    }

    /// 调整载荷长度（只能在底层区间内伸缩），要求独占。
    pub fn set_length(&mut self, length: usize) -> Result<(), OwnershipError> {
        let inner = self.exclusive()?;
        check_view(inner.offset, length, inner.storage.as_slice().len())?;
        inner.length = length;
        Ok(())
    }

    /// 替换描述符（例如接入层补齐 `request_id`），要求独占。
    pub fn set_descriptor(&mut self, descriptor: PacketDescriptor) -> Result<(), OwnershipError> {
        self.exclusive()?.descriptor = descriptor;
        Ok(())
    }

    fn exclusive(&mut self) -> Result<&mut PacketInner, OwnershipError> {
        let holders = Arc::strong_count(&self.inner);
        Arc::get_mut(&mut self.inner).ok_or(OwnershipError::Shared { holders })
    }
}

impl core::fmt::Debug for PacketRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PacketRef")
            .field("descriptor", &self.inner.descriptor)
            .field("offset", &self.inner.offset)
            .field("length", &self.inner.length)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

fn check_view(offset: usize, length: usize, region: usize) -> Result<(), OwnershipError> {
    match offset.checked_add(length) {
        Some(end) if end <= region => Ok(()),
        _ => Err(OwnershipError::OutOfRange {
            offset,
            length,
            region,
        }),
    }
}
