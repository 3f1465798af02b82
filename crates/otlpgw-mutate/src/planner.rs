//! 变更规划：把路由决策与策略规则翻译成 [`MutationPlan`]。
//!
//! # 教案式说明
//! - **意图（Why）**：规划只读报文、只产出 IR，真正的字节修改交给 [`crate::reframe`]，
//!   这样规划结果可以先经过 [`crate::validator`] 审核，再决定是否执行；
//! - **逻辑（How）**：规划器本身无内部可变状态，遍历所需的临时缓冲放在调用方持有的
//!   [`PlanningScratch`] 中，接入线程各持一份并在报文之间复用；
//! - **契约（What）**：策略规划器从不向上抛错，选择器失败一律降级为 `NOOP` 并记录告警。

use std::sync::Arc;

use otlpgw_core::PacketRef;
use otlpgw_wire::{CompiledPath, CompiledPathEvaluator, EvalScratch, FastWireCursor};

use crate::config::DEFAULT_MAX_OPS_PER_PACKET;
use crate::plan::{InplaceMaskOp, MutationPlan, PlanMode};
use crate::policy::{
    CompiledMaskingSnapshot, ControlPlanePolicyProvider, MismatchMode, PolicyActionType,
};
use crate::span::{SelectorError, ValueSpanCollector};

pub const HEALTHCHECK_DROP_REASON: &str = "FINOPS_HEALTHCHECK_DROP";

/// 上游路由层给出的动作。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DecisionAction {
    Pass,
    RouteDefault,
    Drop,
}

/// 路由层对单个请求的决定；规划器只从中读取 `request_id`。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PolicyDecision {
    pub request_id: u64,
    pub action: DecisionAction,
    pub reason_code: u32,
}

impl PolicyDecision {
    pub fn pass(request_id: u64) -> Self {
        Self {
            request_id,
            action: DecisionAction::Pass,
            reason_code: 0,
        }
    }

    pub fn route_default(request_id: u64) -> Self {
        Self {
            request_id,
            action: DecisionAction::RouteDefault,
            reason_code: 0,
        }
    }

    pub fn drop(request_id: u64, reason_code: u32) -> Self {
        Self {
            request_id,
            action: DecisionAction::Drop,
            reason_code,
        }
    }
}

/// 单线程复用的规划缓冲。
#[derive(Debug)]
pub struct PlanningScratch {
    eval: EvalScratch,
    spans: ValueSpanCollector,
}

impl Default for PlanningScratch {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OPS_PER_PACKET)
    }
}

impl PlanningScratch {
    pub fn new(max_spans: usize) -> Self {
        Self {
            eval: EvalScratch::new(),
            spans: ValueSpanCollector::with_capacity(max_spans),
        }
    }

    pub fn spans(&self) -> &ValueSpanCollector {
        &self.spans
    }

    fn ensure_span_capacity(&mut self, capacity: usize) {
        if self.spans.capacity() < capacity {
            self.spans = ValueSpanCollector::with_capacity(capacity);
        }
    }
}

pub trait MutationPlanner: Send + Sync {
    fn plan(
        &self,
        envelope: &PacketRef,
        decision: &PolicyDecision,
        scratch: &mut PlanningScratch,
    ) -> MutationPlan;
}

fn length_of(packet: &PacketRef) -> u32 {
    u32::try_from(packet.length()).unwrap_or(u32::MAX)
}

/// 单路径健康检查规划器：路径命中即整包丢弃。
pub struct HealthcheckSuccessDropPlanner {
    evaluator: Arc<dyn CompiledPathEvaluator>,
    healthcheck_path: CompiledPath,
}

impl HealthcheckSuccessDropPlanner {
    pub fn new(evaluator: Arc<dyn CompiledPathEvaluator>, healthcheck_path: CompiledPath) -> Self {
        Self {
            evaluator,
            healthcheck_path,
        }
    }
}

impl MutationPlanner for HealthcheckSuccessDropPlanner {
    fn plan(
        &self,
        envelope: &PacketRef,
        decision: &PolicyDecision,
        scratch: &mut PlanningScratch,
    ) -> MutationPlan {
        let source_length = length_of(envelope);
        let matched = match FastWireCursor::over(envelope.region(), envelope.offset(), envelope.length()) {
            Ok(cursor) => self
                .evaluator
                .evaluate(&self.healthcheck_path, &cursor, &mut scratch.eval)
                .is_match(),
            Err(err) => {
                tracing::debug!(request_id = decision.request_id, code = err.code(), "healthcheck cursor rejected envelope");
                false
            }
        };

        let builder = MutationPlan::builder(decision.request_id).source_length(source_length);
        if matched {
            tracing::debug!(request_id = decision.request_id, "healthcheck matched, dropping");
            return builder
                .mode(PlanMode::Drop)
                .reason_code(HEALTHCHECK_DROP_REASON)
                .target_length(0)
                .build();
        }
        builder.mode(PlanMode::Noop).target_length(source_length).build()
    }
}

/// 按当前策略快照产出丢弃或原地掩码计划。
pub struct PolicyDrivenMutationPlanner {
    provider: Arc<dyn ControlPlanePolicyProvider>,
    max_mask_ops_per_packet: usize,
}

impl PolicyDrivenMutationPlanner {
    /// `max_mask_ops_per_packet` 至少为 1。
    pub fn new(provider: Arc<dyn ControlPlanePolicyProvider>, max_mask_ops_per_packet: usize) -> Self {
        Self {
            provider,
            max_mask_ops_per_packet: max_mask_ops_per_packet.max(1),
        }
    }

    pub fn max_mask_ops_per_packet(&self) -> usize {
        self.max_mask_ops_per_packet
    }
}

enum RuleOutcome {
    Drop(Arc<str>),
    Masks(Vec<InplaceMaskOp>),
}

impl PolicyDrivenMutationPlanner {
    fn evaluate_rules(
        &self,
        snapshot: &CompiledMaskingSnapshot,
        envelope: &PacketRef,
        scratch: &mut PlanningScratch,
    ) -> Result<RuleOutcome, SelectorError> {
        let signal = envelope.descriptor().signal;
        let mut emitted: Vec<InplaceMaskOp> = Vec::new();

        for rule in snapshot.rules() {
            if !rule.enabled() || !rule.applies_to(signal) {
                continue;
            }
            let matches = rule
                .selector()
                .collect(envelope, &mut scratch.eval, &mut scratch.spans)?;
            if matches == 0 {
                continue;
            }

            match rule.action() {
                PolicyActionType::Drop => {
                    return Ok(RuleOutcome::Drop(Arc::clone(rule.drop_reason())));
                }
                PolicyActionType::RedactMask => {}
            }

            let token = rule.redaction_token();
            for (offset, length) in scratch.spans.iter() {
                if emitted.len() >= self.max_mask_ops_per_packet {
                    break;
                }
                if let Some(token) = token
                    && token.len() != length as usize
                {
                    if rule.mismatch_mode() == MismatchMode::FailClosed {
                        return Ok(RuleOutcome::Drop(Arc::clone(rule.mismatch_reason())));
                    }
                    continue;
                }
                let end = u64::from(offset) + u64::from(length);
                let overlaps = emitted.iter().any(|op| {
                    let (start, stop) = op.range();
                    u64::from(offset) < stop && start < end
                });
                if overlaps {
                    continue;
                }
                emitted.push(
                    InplaceMaskOp::new(offset, length, InplaceMaskOp::DEFAULT_MASK_BYTE)
                        .with_token(token.cloned())
                        .with_reason(Arc::clone(rule.mask_reason())),
                );
            }
            if emitted.len() >= self.max_mask_ops_per_packet {
                break;
            }
        }
        Ok(RuleOutcome::Masks(emitted))
    }
}

impl MutationPlanner for PolicyDrivenMutationPlanner {
    fn plan(
        &self,
        envelope: &PacketRef,
        decision: &PolicyDecision,
        scratch: &mut PlanningScratch,
    ) -> MutationPlan {
        let request_id = decision.request_id;
        let source_length = length_of(envelope);
        let builder = MutationPlan::builder(request_id)
            .source_length(source_length)
            .target_length(source_length);

        let snapshot = self.provider.active_snapshot();
        if !snapshot.enabled() || snapshot.rules().is_empty() {
            return builder.mode(PlanMode::Noop).build();
        }
        scratch.ensure_span_capacity(self.max_mask_ops_per_packet);
        match self.evaluate_rules(&snapshot, envelope, scratch) {
            Ok(RuleOutcome::Drop(reason)) => {
                tracing::debug!(request_id, reason = &*reason, "policy planner dropping packet");
                builder
                    .mode(PlanMode::Drop)
                    .reason_code(reason)
                    .target_length(0)
                    .build()
            }
            Ok(RuleOutcome::Masks(ops)) if ops.is_empty() => builder.mode(PlanMode::Noop).build(),
            Ok(RuleOutcome::Masks(ops)) => {
                tracing::debug!(request_id, mask_ops = ops.len(), "policy planner emitted in-place masks");
                ops.into_iter()
                    .fold(builder.mode(PlanMode::InplaceOnly), |builder, op| builder.pass_a(op))
                    .build()
            }
            Err(err) => {
                tracing::warn!(request_id, code = err.code(), error = %err, "policy planner failed, fail-open NOOP");
                builder.mode(PlanMode::Noop).build()
            }
        }
    }
}
