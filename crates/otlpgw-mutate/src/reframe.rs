//! 重组写入器：按计划执行 Pass A / Pass B，并完成 LEN 前缀级联补丁。
//!
//! # 教案式说明
//! - **意图（Why）**：掩码可以原地完成，但删除字段、改写长度会让后续所有字节位移，
//!   必须在新缓冲中重建报文；
//! - **流程（How）**：
//!   1. `DROP` 计划直接返回 410，目标长度为 0 返回 422；
//!   2. 级联重算 + 操作边界预检，任何问题都在修改源报文之前暴露；
//!   3. 不需要重组时只执行 Pass A，返回源报文的新引用；
//!   4. 需要重组时分配 `max(声明目标, 重算目标, 声明目标 + 右移余量)` 的目标缓冲，
//!      目标缓冲先清零，Pass A → Pass B → 自左向右应用 varint 补丁（累计位移修正后续偏移）→ 完整性修复 → 截断到最终长度；
//! - **契约（What）**：源报文的所有权始终留在调用方；失败时目标缓冲随 `Drop` 归还，不会泄露半成品。

use std::sync::Arc;

use thiserror::Error;

use otlpgw_core::{
    AllocationDenied, AllocationTag, OwnershipError, PacketAllocator, PacketDescriptor, PacketRef,
    StatusCode,
};
use otlpgw_wire::varint::encode_varint32;

use crate::cascade::{CascadeError, LenCascadeRecalculator, Recalculation, VarintPatch};
use crate::integrity::{IntegrityError, IntegrityRepair, NoopIntegrityRepair};
use crate::mask::{MaskError, MaskWriter, ScalarMaskWriter};
use crate::plan::{MutationPlan, PlanOp};

/// 重组结果：成功时调用方获得一个新的报文引用。
pub type ReframeResult = Result<PacketRef, ReframeError>;

/// 重组失败原因，每个变体都映射到网关状态码。
#[derive(Debug, Error)]
pub enum ReframeError {
    #[error("plan drops the packet")]
    Dropped,
    #[error("plan resolves to an empty target")]
    EmptyTarget,
    #[error("{scope} [{start}, {end}) exceeds {bound} bytes")]
    OutOfBounds {
        scope: &'static str,
        start: u64,
        end: u64,
        bound: u64,
    },
    #[error("pass A only accepts mask operations, found {kind}")]
    UnsupportedPassAOp { kind: &'static str },
    #[error("plan changes LEN frame sizes but does not request a reframe")]
    LengthChangeWithoutReframe,
    #[error("source packet cannot be modified in place: {0}")]
    Ownership(#[from] OwnershipError),
    #[error("destination allocation denied: {0}")]
    AllocationDenied(#[from] AllocationDenied),
    #[error("length cascade rejected the plan: {0}")]
    Cascade(#[from] CascadeError),
    #[error("LEN patch for frame {frame_id} is inconsistent: {detail}")]
    Inconsistent { frame_id: u32, detail: &'static str },
    #[error("reframed length {actual} differs from recalculated target {expected}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("mask operation failed: {0}")]
    Mask(#[from] MaskError),
    #[error("integrity repair failed: {0}")]
    Integrity(#[from] IntegrityError),
}

impl ReframeError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Dropped => StatusCode::Gone,
            Self::EmptyTarget
            | Self::OutOfBounds { .. }
            | Self::UnsupportedPassAOp { .. }
            | Self::LengthChangeWithoutReframe => StatusCode::UnprocessableEntity,
            Self::Ownership(_) => StatusCode::Conflict,
            Self::AllocationDenied(denied) => denied.status(),
            Self::Cascade(_)
            | Self::Inconsistent { .. }
            | Self::LengthMismatch { .. }
            | Self::Mask(_)
            | Self::Integrity(_) => StatusCode::InternalError,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Dropped => "reframe.dropped",
            Self::EmptyTarget => "reframe.empty_target",
            Self::OutOfBounds { .. } => "reframe.out_of_bounds",
            Self::UnsupportedPassAOp { .. } => "reframe.unsupported_pass_a_op",
            Self::LengthChangeWithoutReframe => "reframe.length_change_without_reframe",
            Self::Ownership(_) => "reframe.source_not_writable",
            Self::AllocationDenied(_) => "reframe.allocation_denied",
            Self::Cascade(_) => "reframe.cascade",
            Self::Inconsistent { .. } => "reframe.inconsistent_patch",
            Self::LengthMismatch { .. } => "reframe.length_mismatch",
            Self::Mask(_) => "reframe.mask",
            Self::Integrity(_) => "reframe.integrity",
        }
    }
}

/// 重组写入契约。
pub trait ReframeWriter: Send + Sync {
    /// 执行计划；`source` 的所有权不转移，Pass A 要求调用方持有唯一引用。
    fn write(
        &self,
        plan: &MutationPlan,
        source: &mut PacketRef,
        allocator: &dyn PacketAllocator,
    ) -> ReframeResult;
}

/// 默认实现。
#[derive(Clone)]
pub struct DefaultReframeWriter {
    recalculator: LenCascadeRecalculator,
    integrity: Arc<dyn IntegrityRepair>,
    mask_writer: Arc<dyn MaskWriter>,
}

impl Default for DefaultReframeWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DefaultReframeWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultReframeWriter")
            .field("mask_writer", &self.mask_writer.name())
            .finish_non_exhaustive()
    }
}

impl DefaultReframeWriter {
    pub fn new() -> Self {
        Self {
            recalculator: LenCascadeRecalculator::new(),
            integrity: Arc::new(NoopIntegrityRepair),
            mask_writer: Arc::new(ScalarMaskWriter),
        }
    }

    #[must_use]
    pub fn with_integrity(mut self, integrity: Arc<dyn IntegrityRepair>) -> Self {
        self.integrity = integrity;
        self
    }

    #[must_use]
    pub fn with_mask_writer(mut self, mask_writer: Arc<dyn MaskWriter>) -> Self {
        self.mask_writer = mask_writer;
        self
    }

    fn apply_pass_a(&self, plan: &MutationPlan, source: &mut PacketRef) -> Result<(), ReframeError> {
        if plan.pass_a().is_empty() {
            return Ok(());
        }
        let payload = source.payload_mut()?;
        for op in plan.pass_a() {
            if let PlanOp::Mask(mask) = op {
                self.mask_writer.mask(payload, mask)?;
            }
        }
        Ok(())
    }

    fn apply_pass_b(&self, plan: &MutationPlan, source: &[u8], dst: &mut [u8]) -> Result<(), ReframeError> {
        for op in plan.pass_b() {
            match op {
                PlanOp::SliceCopy {
                    src_offset,
                    length,
                    dst_offset,
                } => {
                    let (src, len, at) = (*src_offset as usize, *length as usize, *dst_offset as usize);
                    dst[at..at + len].copy_from_slice(&source[src..src + len]);
                }
                PlanOp::Overwrite {
                    dst_offset, bytes, ..
                } => {
                    let at = *dst_offset as usize;
                    dst[at..at + bytes.len()].copy_from_slice(bytes);
                }
                PlanOp::Mask(mask) => self.mask_writer.mask(dst, mask)?,
                PlanOp::DropRange { .. } => {}
            }
        }
        Ok(())
    }
}

impl ReframeWriter for DefaultReframeWriter {
    fn write(
        &self,
        plan: &MutationPlan,
        source: &mut PacketRef,
        allocator: &dyn PacketAllocator,
    ) -> ReframeResult {
        let request_id = plan.request_id();
        if plan.is_drop() {
            return Err(ReframeError::Dropped);
        }
        let base_target = if plan.target_length() > 0 {
            plan.target_length() as usize
        } else {
            source.length()
        };
        if base_target == 0 {
            return Err(ReframeError::EmptyTarget);
        }

        let recalculation = self.recalculator.recalculate(plan).inspect_err(|err| {
            tracing::error!(request_id, code = err.code(), error = %err, "length cascade rejected plan");
        })?;
        check_operations(plan, source.length(), base_target)?;

        if !plan.requires_reframe() {
            if recalculation
                .patches
                .iter()
                .any(|patch| patch.old_body_length != patch.new_body_length)
            {
                return Err(ReframeError::LengthChangeWithoutReframe);
            }
            self.apply_pass_a(plan, source)?;
            tracing::debug!(request_id, ops = plan.pass_a().len(), "in-place mutation applied");
            return Ok(source.retain());
        }

        let recalculated = recalculation.target_length as usize;
        let capacity = base_target
            .max(recalculated)
            .max(base_target + recalculation.growth_headroom());
        let descriptor = *source.descriptor();
        let tag = AllocationTag::new("reframe", "pass_b", descriptor.signal);
        let mut dst = allocator.allocate(capacity, tag).inspect_err(|denied| {
            tracing::warn!(request_id, capacity, code = denied.code(), "reframe destination denied");
        })?;

        // 之后的任何失败都会随 `dst` 析构归还目标缓冲。
        self.apply_pass_a(plan, source)?;
        let final_length = {
            let buffer = dst.payload_mut()?;
            // slab 复用时不清零；计划未覆盖的区间不能带出上一个报文的字节。
            buffer.fill(0);
            self.apply_pass_b(plan, source.payload(), buffer)?;
            let final_length = apply_varint_patches(buffer, base_target, &recalculation)
                .inspect_err(|err| {
                    tracing::error!(request_id, code = err.code(), error = %err, "LEN patch failed");
                })?;
            self.integrity.repair(&mut buffer[..final_length])?;
            final_length
        };
        dst.set_length(final_length)?;
        dst.set_descriptor(PacketDescriptor {
            packet_id: dst.descriptor().packet_id,
            ..descriptor
        })?;
        tracing::debug!(
            request_id,
            source_length = source.length(),
            final_length,
            patches = recalculation.patches.len(),
            "packet reframed"
        );
        Ok(dst)
    }
}

/// 在触碰任何字节之前确认所有操作都在各自缓冲之内。
fn check_operations(plan: &MutationPlan, source_length: usize, target_length: usize) -> Result<(), ReframeError> {
    let within = |scope: &'static str, (start, end): (u64, u64), bound: usize| {
        if end > bound as u64 {
            Err(ReframeError::OutOfBounds {
                scope,
                start,
                end,
                bound: bound as u64,
            })
        } else {
            Ok(())
        }
    };
    for op in plan.pass_a() {
        let PlanOp::Mask(mask) = op else {
            return Err(ReframeError::UnsupportedPassAOp { kind: op.kind() });
        };
        within("pass_a.mask", mask.range(), source_length)?;
    }
    for op in plan.pass_b() {
        if let PlanOp::SliceCopy {
            src_offset, length, ..
        } = op
        {
            let start = u64::from(*src_offset);
            within("pass_b.slice.src", (start, start + u64::from(*length)), source_length)?;
        }
        if let Some(range) = op.dst_range() {
            within("pass_b.dst", range, target_length)?;
        }
    }
    Ok(())
}

/// 自左向右应用补丁，返回最终长度。
///
/// `buffer` 的前 `base_length` 字节是旧前缀宽度下的目标布局，其后至少预留了全部右移量。
fn apply_varint_patches(
    buffer: &mut [u8],
    base_length: usize,
    recalculation: &Recalculation,
) -> Result<usize, ReframeError> {
    let mut effective = base_length;
    let mut shift: isize = 0;
    for patch in &recalculation.patches {
        let write_at = (patch.length_field_offset as isize)
            .checked_add(shift)
            .and_then(|at| usize::try_from(at).ok())
            .ok_or_else(|| inconsistent(patch, "shifted offset is negative"))?;
        let body_start = write_at + patch.old_varint_size;
        let tail = effective
            .checked_sub(body_start)
            .ok_or_else(|| inconsistent(patch, "tail range is negative"))?;
        let delta = patch.varint_delta();

        if delta > 0 {
            let grow = delta as usize;
            if body_start + tail + grow > buffer.len() {
                return Err(inconsistent(patch, "right shift exceeds destination"));
            }
            buffer.copy_within(body_start..body_start + tail, body_start + grow);
        } else if delta < 0 {
            let shrink = delta.unsigned_abs();
            buffer.copy_within(body_start..body_start + tail, body_start - shrink);
        }

        let written = encode_varint32(patch.new_body_length, &mut buffer[write_at..])
            .ok_or_else(|| inconsistent(patch, "no room for length prefix"))?;
        if written != patch.new_varint_size {
            return Err(inconsistent(patch, "re-encoded prefix width differs"));
        }
        effective = effective
            .checked_add_signed(delta)
            .ok_or_else(|| inconsistent(patch, "length underflow"))?;
        shift += delta;
    }

    let expected = if recalculation.target_length > 0 {
        recalculation.target_length as usize
    } else {
        effective
    };
    if effective != expected {
        return Err(ReframeError::LengthMismatch {
            expected,
            actual: effective,
        });
    }
    Ok(effective)
}

fn inconsistent(patch: &VarintPatch, detail: &'static str) -> ReframeError {
    ReframeError::Inconsistent {
        frame_id: patch.frame_id,
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{InplaceMaskOp, LengthDelta, PlanMode};
    use otlpgw_core::{SignalKind, SlabPacketAllocator};

    fn packet(bytes: Vec<u8>) -> PacketRef {
        PacketRef::wrap(bytes, PacketDescriptor::for_signal(SignalKind::Logs).with_request_id(5))
    }

    #[test]
    fn drop_and_empty_plans_map_to_status() {
        let allocator = SlabPacketAllocator::new(1024);
        let writer = DefaultReframeWriter::new();
        let mut src = packet(vec![1, 2, 3]);

        let drop = MutationPlan::builder(1).mode(PlanMode::Drop).build();
        let err = writer.write(&drop, &mut src, &allocator).unwrap_err();
        assert_eq!(err.status(), StatusCode::Gone);

        let mut empty = packet(Vec::new());
        let err = writer
            .write(&MutationPlan::noop(1, 0), &mut empty, &allocator)
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::UnprocessableEntity);
    }

    #[test]
    fn inplace_plan_masks_source_and_returns_it() {
        let allocator = SlabPacketAllocator::new(1024);
        let mut src = packet(b"secret-value".to_vec());
        let plan = MutationPlan::builder(1)
            .mode(PlanMode::InplaceOnly)
            .pass_a(InplaceMaskOp::new(0, 6, b'*'))
            .build();
        let out = DefaultReframeWriter::new()
            .write(&plan, &mut src, &allocator)
            .expect("in place");
        assert_eq!(out.payload(), b"******-value");
        assert_eq!(src.ref_count(), 2);
        assert_eq!(allocator.stats().alloc_count, 0);
    }

    #[test]
    fn shared_source_conflicts() {
        let allocator = SlabPacketAllocator::new(1024);
        let mut src = packet(b"abcd".to_vec());
        let _other = src.retain();
        let plan = MutationPlan::builder(1)
            .mode(PlanMode::InplaceOnly)
            .pass_a(InplaceMaskOp::new(0, 2, b'*'))
            .build();
        let err = DefaultReframeWriter::new()
            .write(&plan, &mut src, &allocator)
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::Conflict);
        assert_eq!(src.payload(), b"abcd");
    }

    #[test]
    fn denied_allocation_is_insufficient_storage() {
        let allocator = SlabPacketAllocator::new(8);
        let mut src = packet(vec![0u8; 16]);
        let plan = MutationPlan::builder(1)
            .mode(PlanMode::Reframe)
            .pass_b(PlanOp::SliceCopy {
                src_offset: 0,
                length: 16,
                dst_offset: 0,
            })
            .build();
        let err = DefaultReframeWriter::new()
            .write(&plan, &mut src, &allocator)
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::InsufficientStorage);
        assert_eq!(err.code(), "reframe.allocation_denied");
    }

    #[test]
    fn recycled_slab_bytes_never_reach_uncovered_destination_ranges() {
        let allocator = SlabPacketAllocator::new(64);
        let tag = AllocationTag::new("test", "previous", SignalKind::Logs);
        let mut previous = allocator.allocate(32, tag).expect("granted");
        previous.payload_mut().expect("exclusive").fill(0xEE);
        drop(previous);
        assert_eq!(allocator.stats().in_use_bytes, 0);

        let mut src = packet(vec![1, 2, 3, 4]);
        let plan = MutationPlan::builder(1)
            .mode(PlanMode::Reframe)
            .source_length(4)
            .target_length(8)
            .pass_b(PlanOp::SliceCopy {
                src_offset: 0,
                length: 4,
                dst_offset: 0,
            })
            .build();
        let out = DefaultReframeWriter::new()
            .write(&plan, &mut src, &allocator)
            .expect("reframe succeeds");
        assert_eq!(out.payload(), &[1, 2, 3, 4, 0, 0, 0, 0]);
    }

    #[test]
    fn cascade_fault_releases_destination() {
        let allocator = SlabPacketAllocator::new(1024);
        let mut src = packet(vec![0x0A, 0x02, 1, 2]);
        let plan = MutationPlan::builder(1)
            .mode(PlanMode::Reframe)
            .length_delta(LengthDelta {
                frame_id: 0,
                parent_frame_id: Some(3),
                frame_start_offset: 0,
                length_field_offset: 1,
                old_body_length: 2,
                new_body_length: 2,
            })
            .build();
        let err = DefaultReframeWriter::new()
            .write(&plan, &mut src, &allocator)
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::InternalError);
        assert_eq!(allocator.stats().in_use_bytes, 0);
    }
}
