//! LEN 级联重算：子帧体长变化沿祖先链向上传播，并给出每个长度前缀的 varint 宽度迁移。
//!
//! # 教案式说明
//! - **意图（Why）**：protobuf 的 LEN 前缀本身是变长的；子帧体长跨越 127/16383 等边界时，
//!   子帧前缀变宽，父帧体长随之变化，可能继续触发父帧前缀变宽；
//! - **逻辑（How）**：
//!   1. 由 `frame_id/parent_frame_id` 建立显式父子树，重复 id、缺失父帧、环都是硬错误；
//!   2. 显式栈后序遍历，每个帧的有效体长 = 本帧规划体长 + Σ 子帧编码尺寸增量；
//!   3. 为每个帧计算 varint 宽度迁移，按 `length_field_offset` 升序输出补丁；
//! - **契约（What）**：`target_length` 为 `基准长度 + Σ(新宽度 − 旧宽度)`，基准取计划目标长度，
//!   缺省时取源长度；基准为 0 时结果为 0。

use std::collections::BTreeMap;

use thiserror::Error;

use otlpgw_wire::varint::varint_size;

use crate::plan::MutationPlan;

/// 级联树不变量被破坏；都意味着规划器产出了错误的计划。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum CascadeError {
    #[error("duplicate frame id {frame_id} in length deltas")]
    DuplicateFrame { frame_id: u32 },
    #[error("frame {frame_id} references missing parent {parent_frame_id}")]
    MissingParent { frame_id: u32, parent_frame_id: u32 },
    #[error("cycle detected in length delta hierarchy at frame {frame_id}")]
    Cycle { frame_id: u32 },
    #[error("cascaded body length of frame {frame_id} became negative")]
    NegativeBody { frame_id: u32 },
    #[error("cascaded length of frame {frame_id} exceeds the 32-bit length space")]
    LengthOverflow { frame_id: u32 },
}

impl CascadeError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::DuplicateFrame { .. } => "cascade.duplicate_frame",
            Self::MissingParent { .. } => "cascade.missing_parent",
            Self::Cycle { .. } => "cascade.cycle",
            Self::NegativeBody { .. } => "cascade.negative_body",
            Self::LengthOverflow { .. } => "cascade.length_overflow",
        }
    }
}

/// 单个长度前缀的重写指令。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VarintPatch {
    pub frame_id: u32,
    pub parent_frame_id: Option<u32>,
    pub frame_start_offset: u32,
    pub length_field_offset: u32,
    pub old_body_length: u32,
    pub new_body_length: u32,
    pub old_varint_size: usize,
    pub new_varint_size: usize,
}

impl VarintPatch {
    /// 前缀宽度变化量，正数表示尾部需要右移。
    pub fn varint_delta(&self) -> isize {
        self.new_varint_size as isize - self.old_varint_size as isize
    }
}

/// 重算结果。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Recalculation {
    pub target_length: u32,
    pub patches: Vec<VarintPatch>,
}

impl Recalculation {
    /// 所有补丁中右移量之和，用于给原地搬移预留空间。
    pub fn growth_headroom(&self) -> usize {
        self.patches
            .iter()
            .map(|patch| patch.new_varint_size.saturating_sub(patch.old_varint_size))
            .sum()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Fresh,
    Visiting,
    Done,
}

struct FrameState {
    parent: Option<u32>,
    frame_start_offset: u32,
    length_field_offset: u32,
    old_body: u32,
    local_new_body: u32,
    effective_new_body: u32,
    mark: Mark,
}

impl FrameState {
    fn encoded_size_delta(&self) -> i64 {
        (varint_size(self.effective_new_body) as i64 + i64::from(self.effective_new_body))
            - (varint_size(self.old_body) as i64 + i64::from(self.old_body))
    }
}

/// 无状态的级联重算器。
#[derive(Clone, Copy, Debug, Default)]
pub struct LenCascadeRecalculator;

impl LenCascadeRecalculator {
    pub fn new() -> Self {
        Self
    }

    pub fn recalculate(&self, plan: &MutationPlan) -> Result<Recalculation, CascadeError> {
        let mut frames: BTreeMap<u32, FrameState> = BTreeMap::new();
        let mut children: BTreeMap<u32, Vec<u32>> = BTreeMap::new();

        for delta in plan.length_deltas() {
            if frames.contains_key(&delta.frame_id) {
                return Err(CascadeError::DuplicateFrame {
                    frame_id: delta.frame_id,
                });
            }
            frames.insert(
                delta.frame_id,
                FrameState {
                    parent: delta.parent_frame_id,
                    frame_start_offset: delta.frame_start_offset,
                    length_field_offset: delta.length_field_offset,
                    old_body: delta.old_body_length,
                    local_new_body: delta.new_body_length,
                    effective_new_body: delta.new_body_length,
                    mark: Mark::Fresh,
                },
            );
            if let Some(parent) = delta.parent_frame_id {
                children.entry(parent).or_default().push(delta.frame_id);
            }
        }
        for (&frame_id, state) in &frames {
            if let Some(parent) = state.parent
                && !frames.contains_key(&parent)
            {
                return Err(CascadeError::MissingParent {
                    frame_id,
                    parent_frame_id: parent,
                });
            }
        }

        for frame_id in post_order(&mut frames, &children)? {
            let mut cascaded = frames
                .get(&frame_id)
                .map_or(0, |state| i64::from(state.local_new_body));
            for child in children.get(&frame_id).map_or(&[][..], Vec::as_slice) {
                if let Some(state) = frames.get(child) {
                    cascaded += state.encoded_size_delta();
                }
            }
            if cascaded < 0 {
                return Err(CascadeError::NegativeBody { frame_id });
            }
            let effective =
                u32::try_from(cascaded).map_err(|_| CascadeError::LengthOverflow { frame_id })?;
            if let Some(state) = frames.get_mut(&frame_id) {
                state.effective_new_body = effective;
            }
        }

        let mut total_varint_delta: i64 = 0;
        let mut patches: Vec<VarintPatch> = frames
            .iter()
            .map(|(&frame_id, state)| {
                let old_varint_size = varint_size(state.old_body);
                let new_varint_size = varint_size(state.effective_new_body);
                total_varint_delta += new_varint_size as i64 - old_varint_size as i64;
                VarintPatch {
                    frame_id,
                    parent_frame_id: state.parent,
                    frame_start_offset: state.frame_start_offset,
                    length_field_offset: state.length_field_offset,
                    old_body_length: state.old_body,
                    new_body_length: state.effective_new_body,
                    old_varint_size,
                    new_varint_size,
                }
            })
            .collect();
        patches.sort_by_key(|patch| patch.length_field_offset);

        let base = if plan.target_length() > 0 {
            plan.target_length()
        } else {
            plan.source_length()
        };
        let target_length = if base > 0 {
            let target = i64::from(base) + total_varint_delta;
            u32::try_from(target).map_err(|_| CascadeError::LengthOverflow {
                frame_id: patches.first().map_or(0, |patch| patch.frame_id),
            })?
        } else {
            0
        };

        Ok(Recalculation {
            target_length,
            patches,
        })
    }

    /// 体长从 `old` 变为 `new` 时长度前缀的宽度变化量。
    pub fn varint_size_delta(&self, old_body_length: u32, new_body_length: u32) -> isize {
        varint_size(new_body_length) as isize - varint_size(old_body_length) as isize
    }
}

/// 显式栈后序遍历：子帧总是先于父帧出现在结果中。
fn post_order(
    frames: &mut BTreeMap<u32, FrameState>,
    children: &BTreeMap<u32, Vec<u32>>,
) -> Result<Vec<u32>, CascadeError> {
    let ids: Vec<u32> = frames.keys().copied().collect();
    let mut order = Vec::with_capacity(ids.len());
    let mut stack: Vec<(u32, usize)> = Vec::new();

    for start in ids {
        if frames.get(&start).is_some_and(|state| state.mark != Mark::Fresh) {
            continue;
        }
        set_mark(frames, start, Mark::Visiting);
        stack.push((start, 0));

        while let Some(top) = stack.last_mut() {
            let frame_id = top.0;
            let kids = children.get(&frame_id).map_or(&[][..], Vec::as_slice);
            if let Some(&child) = kids.get(top.1) {
                top.1 += 1;
                match frames.get(&child).map(|state| state.mark) {
                    Some(Mark::Visiting) => return Err(CascadeError::Cycle { frame_id: child }),
                    Some(Mark::Fresh) => {
                        set_mark(frames, child, Mark::Visiting);
                        stack.push((child, 0));
                    }
                    Some(Mark::Done) | None => {}
                }
            } else {
                stack.pop();
                set_mark(frames, frame_id, Mark::Done);
                order.push(frame_id);
            }
        }
    }

    // 环上的帧互为祖先，从任何起点出发都会先遇到 Visiting 标记。
    Ok(order)
}

fn set_mark(frames: &mut BTreeMap<u32, FrameState>, frame_id: u32, mark: Mark) {
    if let Some(state) = frames.get_mut(&frame_id) {
        state.mark = mark;
    }
}
