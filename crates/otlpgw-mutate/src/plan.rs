//! 变更计划的中间表示（IR）。
//!
//! # 教案式说明
//! - **意图（Why）**：规划器只负责“决定改什么”，重组写入器只负责“按计划改”，两者之间需要一个
//!   可校验、可重放的纯数据结构；
//! - **结构（How）**：
//!   - Pass A：直接作用于源报文的原地操作，只允许掩码，永不改变长度；
//!   - Pass B：写入新目标缓冲的操作（切片复制、原样覆盖、掩码）；
//!   - 长度增量（[`LengthDelta`]）：描述 LEN 帧体长度的变化，由级联重算器自底向上传播；
//! - **契约（What）**：偏移与长度均为 32 位无符号数；Pass A 的偏移相对源载荷，Pass B 的偏移相对目标载荷；
//!   `target_length` 是应用 varint 宽度补丁之前的目标长度，`0` 表示沿用源长度。

use std::fmt;
use std::sync::Arc;

/// 计划模式。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum PlanMode {
    /// 不做任何修改，原样放行。
    #[default]
    Noop,
    /// 只在源报文上原地掩码。
    InplaceOnly,
    /// 需要分配新缓冲并重排结构。
    Reframe,
    /// 整个报文被丢弃。
    Drop,
}

impl PlanMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Noop => "NOOP",
            Self::InplaceOnly => "INPLACE_ONLY",
            Self::Reframe => "REFRAME",
            Self::Drop => "DROP",
        }
    }
}

impl fmt::Display for PlanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 原地掩码操作：把 `[absolute_offset, absolute_offset + length)` 覆盖为掩码字节或令牌。
///
/// 令牌语义：
/// - 无令牌：用 `mask_byte` 填充；
/// - 单字节令牌：重复该字节填充；
/// - 与区间等长的令牌：逐字节拷贝；
/// - 其它长度：退回 `mask_byte` 填充（规划器与校验器都会先拒绝这种组合）。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InplaceMaskOp {
    pub absolute_offset: u32,
    pub length: u32,
    pub mask_byte: u8,
    pub token: Option<Arc<[u8]>>,
    pub reason: Arc<str>,
}

impl InplaceMaskOp {
    /// 默认掩码字节 `*`。
    pub const DEFAULT_MASK_BYTE: u8 = b'*';

    pub fn new(absolute_offset: u32, length: u32, mask_byte: u8) -> Self {
        Self {
            absolute_offset,
            length,
            mask_byte,
            token: None,
            reason: Arc::from(""),
        }
    }

    /// 设置令牌；空令牌等价于无令牌。
    pub fn with_token(mut self, token: Option<Arc<[u8]>>) -> Self {
        self.token = token.filter(|bytes| !bytes.is_empty());
        self
    }

    pub fn with_reason(mut self, reason: Arc<str>) -> Self {
        self.reason = reason;
        self
    }

    pub fn token_bytes(&self) -> Option<&[u8]> {
        self.token.as_deref()
    }

    /// 严格原地语义：令牌缺省，或与区间等长。
    pub fn token_matches_length(&self) -> bool {
        self.token_bytes()
            .is_none_or(|token| token.len() == self.length as usize)
    }

    pub(crate) fn range(&self) -> (u64, u64) {
        let start = u64::from(self.absolute_offset);
        (start, start + u64::from(self.length))
    }
}

/// 计划中的单个字节操作。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PlanOp {
    /// 把源 `[src_offset, src_offset + length)` 复制到目标 `dst_offset`。
    SliceCopy {
        src_offset: u32,
        length: u32,
        dst_offset: u32,
    },
    /// 把 `bytes` 原样写到目标 `dst_offset`。
    Overwrite {
        dst_offset: u32,
        bytes: Arc<[u8]>,
        reason: Arc<str>,
    },
    /// 掩码；在 Pass A 中相对源载荷，在 Pass B 中相对目标载荷。
    Mask(InplaceMaskOp),
    /// 标记源中被省略的区间；写入器不产生任何字节。
    DropRange {
        src_offset: u32,
        length: u32,
        reason: Arc<str>,
    },
}

impl PlanOp {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SliceCopy { .. } => "slice_copy",
            Self::Overwrite { .. } => "overwrite",
            Self::Mask(_) => "mask",
            Self::DropRange { .. } => "drop_range",
        }
    }

    /// 该操作写入目标缓冲的区间 `[start, end)`；`DropRange` 不写入。
    pub(crate) fn dst_range(&self) -> Option<(u64, u64)> {
        match self {
            Self::SliceCopy {
                length, dst_offset, ..
            } => {
                let start = u64::from(*dst_offset);
                Some((start, start + u64::from(*length)))
            }
            Self::Overwrite {
                dst_offset, bytes, ..
            } => {
                let start = u64::from(*dst_offset);
                Some((start, start + bytes.len() as u64))
            }
            Self::Mask(op) => Some(op.range()),
            Self::DropRange { .. } => None,
        }
    }
}

impl From<InplaceMaskOp> for PlanOp {
    fn from(op: InplaceMaskOp) -> Self {
        Self::Mask(op)
    }
}

/// 单个 LEN 帧的体长变化。
///
/// - `parent_frame_id == None` 表示根帧；
/// - `new_body_length` 是本帧自身的规划结果，不含子帧 varint 变宽带来的增量，
///   子帧增量由 [`LenCascadeRecalculator`](crate::cascade::LenCascadeRecalculator) 自底向上累加。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct LengthDelta {
    pub frame_id: u32,
    pub parent_frame_id: Option<u32>,
    pub frame_start_offset: u32,
    pub length_field_offset: u32,
    pub old_body_length: u32,
    pub new_body_length: u32,
}

impl LengthDelta {
    pub fn length_changed(&self) -> bool {
        self.old_body_length != self.new_body_length
    }
}

/// 完整的变更计划，构造后不可变。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MutationPlan {
    request_id: u64,
    mode: PlanMode,
    pass_a: Vec<PlanOp>,
    pass_b: Vec<PlanOp>,
    length_deltas: Vec<LengthDelta>,
    source_length: u32,
    target_length: u32,
    reason_code: Arc<str>,
}

impl MutationPlan {
    pub fn builder(request_id: u64) -> MutationPlanBuilder {
        MutationPlanBuilder::new(request_id)
    }

    /// 原样放行的计划，目标长度等于源长度。
    pub fn noop(request_id: u64, source_length: u32) -> Self {
        Self::builder(request_id)
            .source_length(source_length)
            .target_length(source_length)
            .build()
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn mode(&self) -> PlanMode {
        self.mode
    }

    pub fn pass_a(&self) -> &[PlanOp] {
        &self.pass_a
    }

    pub fn pass_b(&self) -> &[PlanOp] {
        &self.pass_b
    }

    pub fn length_deltas(&self) -> &[LengthDelta] {
        &self.length_deltas
    }

    pub fn source_length(&self) -> u32 {
        self.source_length
    }

    pub fn target_length(&self) -> u32 {
        self.target_length
    }

    pub fn reason_code(&self) -> &str {
        &self.reason_code
    }

    pub fn operation_count(&self) -> usize {
        self.pass_a.len() + self.pass_b.len()
    }

    /// `REFRAME` 模式或存在任何 Pass B 操作时需要新缓冲。
    pub fn requires_reframe(&self) -> bool {
        self.mode == PlanMode::Reframe || !self.pass_b.is_empty()
    }

    pub fn is_drop(&self) -> bool {
        self.mode == PlanMode::Drop
    }
}

/// [`MutationPlan`] 的构建器。
#[derive(Clone, Debug)]
pub struct MutationPlanBuilder {
    plan: MutationPlan,
}

impl MutationPlanBuilder {
    pub fn new(request_id: u64) -> Self {
        Self {
            plan: MutationPlan {
                request_id,
                mode: PlanMode::Noop,
                pass_a: Vec::new(),
                pass_b: Vec::new(),
                length_deltas: Vec::new(),
                source_length: 0,
                target_length: 0,
                reason_code: Arc::from(""),
            },
        }
    }

    pub fn mode(mut self, mode: PlanMode) -> Self {
        self.plan.mode = mode;
        self
    }

    pub fn source_length(mut self, length: u32) -> Self {
        self.plan.source_length = length;
        self
    }

    pub fn target_length(mut self, length: u32) -> Self {
        self.plan.target_length = length;
        self
    }

    pub fn reason_code(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.plan.reason_code = reason.into();
        self
    }

    pub fn pass_a(mut self, op: impl Into<PlanOp>) -> Self {
        self.plan.pass_a.push(op.into());
        self
    }

    pub fn pass_b(mut self, op: impl Into<PlanOp>) -> Self {
        self.plan.pass_b.push(op.into());
        self
    }

    pub fn length_delta(mut self, delta: LengthDelta) -> Self {
        self.plan.length_deltas.push(delta);
        self
    }

    /// 当前已收集的 Pass A 操作数。
    pub fn pass_a_len(&self) -> usize {
        self.plan.pass_a.len()
    }

    pub fn build(self) -> MutationPlan {
        self.plan
    }
}
