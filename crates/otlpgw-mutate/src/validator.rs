//! 变更计划的结构校验。
//!
//! 校验失败的计划在边界处整体拒绝（映射为 422），写入器永远不会执行半个计划。

use thiserror::Error;

use otlpgw_wire::varint::varint_size;

use crate::plan::{MutationPlan, PlanMode, PlanOp};

/// 单条校验错误。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum ValidationError {
    #[error("plan declares source length {declared}, actual is {actual}")]
    SourceLengthMismatch { declared: u32, actual: u32 },
    #[error("{scope} out of bounds: [{start}, {end}) > {bound}")]
    OutOfBounds {
        scope: &'static str,
        start: u64,
        end: u64,
        bound: u64,
    },
    #[error("{scope} token of {token} bytes does not match mask length {length}")]
    TokenLengthMismatch {
        scope: &'static str,
        token: usize,
        length: u32,
    },
    #[error("pass A only accepts mask operations, found {kind}")]
    UnsupportedPassAOp { kind: &'static str },
    #[error("length delta for frame {frame_id} exceeds source bounds: end {end} > {bound}")]
    LengthDeltaOutOfBounds { frame_id: u32, end: u64, bound: u64 },
    #[error("INPLACE_ONLY plan carries {changed} LEN frame size change(s)")]
    InplaceWithLengthChange { changed: usize },
    #[error("pass A mask [{start}, {end}) overlaps LEN-changing frame {frame_id}")]
    InplaceOverlapsLengthChange { start: u64, end: u64, frame_id: u32 },
    #[error("{scope} overlap: [{first_start}, {first_end}) vs [{second_start}, {second_end})")]
    Overlap {
        scope: &'static str,
        first_start: u64,
        first_end: u64,
        second_start: u64,
        second_end: u64,
    },
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::SourceLengthMismatch { .. } => "plan.source_length_mismatch",
            Self::OutOfBounds { .. } => "plan.out_of_bounds",
            Self::TokenLengthMismatch { .. } => "plan.token_length_mismatch",
            Self::UnsupportedPassAOp { .. } => "plan.unsupported_pass_a_op",
            Self::LengthDeltaOutOfBounds { .. } => "plan.length_delta_out_of_bounds",
            Self::InplaceWithLengthChange { .. } => "plan.inplace_with_length_change",
            Self::InplaceOverlapsLengthChange { .. } => "plan.inplace_overlaps_length_change",
            Self::Overlap { .. } => "plan.overlap",
        }
    }
}

/// 校验结论；`errors` 为空即合法。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Clone, Copy, Debug)]
struct Interval {
    start: u64,
    end: u64,
    frame_id: u32,
}

/// 无状态校验器，可在线程间共享。
///
/// 检查项：
/// - 声明的源长度与实际一致；
/// - 每个操作的字节区间都落在对应缓冲内（Pass A 对源，Pass B 的写入对目标）；
/// - Pass A 区间两两不重叠，Pass B 目标区间两两不重叠（扫描线）；
/// - Pass A 不触碰任何体长发生变化的 LEN 帧；
/// - `INPLACE_ONLY` 计划不得携带实际改变长度的增量。
#[derive(Clone, Copy, Debug, Default)]
pub struct MutationPlanValidator;

impl MutationPlanValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, plan: &MutationPlan, source_length: u32) -> ValidationResult {
        let mut errors = Vec::new();

        if plan.source_length() > 0 && plan.source_length() != source_length {
            errors.push(ValidationError::SourceLengthMismatch {
                declared: plan.source_length(),
                actual: source_length,
            });
        }
        let source = u64::from(source_length);
        let target = if plan.target_length() > 0 {
            u64::from(plan.target_length())
        } else {
            source
        };

        let changed = changed_length_zones(plan, source, &mut errors);
        if !changed.is_empty() && plan.mode() == PlanMode::InplaceOnly {
            errors.push(ValidationError::InplaceWithLengthChange {
                changed: changed.len(),
            });
        }

        let mut in_place = Vec::with_capacity(plan.pass_a().len());
        for op in plan.pass_a() {
            let PlanOp::Mask(mask) = op else {
                errors.push(ValidationError::UnsupportedPassAOp { kind: op.kind() });
                continue;
            };
            let (start, end) = mask.range();
            check_range("pass_a.mask", start, end, source, &mut errors);
            if !mask.token_matches_length() {
                errors.push(ValidationError::TokenLengthMismatch {
                    scope: "pass_a.mask",
                    token: mask.token_bytes().map_or(0, <[u8]>::len),
                    length: mask.length,
                });
            }
            if let Some(zone) = changed.iter().find(|zone| start < zone.end && zone.start < end) {
                errors.push(ValidationError::InplaceOverlapsLengthChange {
                    start,
                    end,
                    frame_id: zone.frame_id,
                });
            }
            in_place.push(Interval {
                start,
                end,
                frame_id: 0,
            });
        }

        let mut writes = Vec::with_capacity(plan.pass_b().len());
        for op in plan.pass_b() {
            match op {
                PlanOp::SliceCopy {
                    src_offset, length, ..
                } => {
                    let start = u64::from(*src_offset);
                    check_range(
                        "pass_b.slice.src",
                        start,
                        start + u64::from(*length),
                        source,
                        &mut errors,
                    );
                }
                PlanOp::Mask(mask) if !mask.token_matches_length() => {
                    errors.push(ValidationError::TokenLengthMismatch {
                        scope: "pass_b.mask",
                        token: mask.token_bytes().map_or(0, <[u8]>::len),
                        length: mask.length,
                    });
                }
                _ => {}
            }
            if let Some((start, end)) = op.dst_range() {
                check_range(dst_scope(op), start, end, target, &mut errors);
                writes.push(Interval {
                    start,
                    end,
                    frame_id: 0,
                });
            }
        }

        detect_overlap("pass_a", &mut in_place, &mut errors);
        detect_overlap("pass_b.dst", &mut writes, &mut errors);

        ValidationResult { errors }
    }
}

fn dst_scope(op: &PlanOp) -> &'static str {
    match op {
        PlanOp::SliceCopy { .. } => "pass_b.slice.dst",
        PlanOp::Overwrite { .. } => "pass_b.overwrite.dst",
        PlanOp::Mask(_) => "pass_b.mask.dst",
        PlanOp::DropRange { .. } => "pass_b.drop",
    }
}

fn check_range(
    scope: &'static str,
    start: u64,
    end: u64,
    bound: u64,
    errors: &mut Vec<ValidationError>,
) {
    if end > bound {
        errors.push(ValidationError::OutOfBounds {
            scope,
            start,
            end,
            bound,
        });
    }
}

/// 每个体长变化的帧占据 `[length_field_offset, length_field_offset + varint + old_body)`。
fn changed_length_zones(
    plan: &MutationPlan,
    source: u64,
    errors: &mut Vec<ValidationError>,
) -> Vec<Interval> {
    let mut changed = Vec::new();
    for delta in plan.length_deltas() {
        let start = u64::from(delta.length_field_offset);
        let end = start
            + varint_size(delta.old_body_length) as u64
            + u64::from(delta.old_body_length);
        if end > source {
            errors.push(ValidationError::LengthDeltaOutOfBounds {
                frame_id: delta.frame_id,
                end,
                bound: source,
            });
            continue;
        }
        if delta.length_changed() {
            changed.push(Interval {
                start,
                end,
                frame_id: delta.frame_id,
            });
        }
    }
    changed
}

fn detect_overlap(
    scope: &'static str,
    intervals: &mut [Interval],
    errors: &mut Vec<ValidationError>,
) {
    if intervals.len() <= 1 {
        return;
    }
    intervals.sort_unstable_by_key(|interval| (interval.start, interval.end));
    let mut prev = intervals[0];
    for current in &intervals[1..] {
        if current.start < prev.end {
            errors.push(ValidationError::Overlap {
                scope,
                first_start: prev.start,
                first_end: prev.end,
                second_start: current.start,
                second_end: current.end,
            });
            if current.end > prev.end {
                prev = *current;
            }
        } else {
            prev = *current;
        }
    }
}
