use thiserror::Error;

/// 线格式错误的分类。
///
/// 每个变体对应一种互不混淆的畸形输入，调用方据此区分“截断”“非法 tag”“嵌套过深”等情况；
/// 这些错误一律视为“输入畸形”，不会导致进程崩溃。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum WireErrorKind {
    /// tag 为 0 或字段号为 0。
    InvalidTag,
    /// 剩余字节不足，或 LEN 长度为负 / 超出父帧。
    TruncatedFrame,
    /// varint 超出允许的字节数。
    VarintOverflow,
    /// 线类型不在 {0, 1, 2, 5} 之内，或在非 LEN 字段上请求下钻。
    UnsupportedWireType,
    /// `leave_message` 时帧栈为空。
    FrameStackUnderflow,
    /// 嵌套深度超过固定上限。
    NestingLimit,
}

impl WireErrorKind {
    /// 稳定错误码。
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidTag => "wire.invalid_tag",
            Self::TruncatedFrame => "wire.truncated_frame",
            Self::VarintOverflow => "wire.varint_overflow",
            Self::UnsupportedWireType => "wire.unsupported_wire_type",
            Self::FrameStackUnderflow => "wire.frame_stack_underflow",
            Self::NestingLimit => "wire.nesting_limit",
        }
    }
}

/// 携带出错字节偏移的线格式错误。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
#[error("{} at byte {position}", kind.as_str())]
pub struct WireError {
    /// 错误分类。
    pub kind: WireErrorKind,
    /// 出错位置（相对于被扫描区间的绝对偏移）。
    pub position: usize,
}

impl WireError {
    pub(crate) const fn new(kind: WireErrorKind, position: usize) -> Self {
        Self { kind, position }
    }

    /// 稳定错误码，等价于 `kind.as_str()`。
    pub const fn code(&self) -> &'static str {
        self.kind.as_str()
    }
}
