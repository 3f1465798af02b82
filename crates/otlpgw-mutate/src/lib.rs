#![deny(unsafe_code)]

//! `otlpgw-mutate`：在线格式层面对 OTLP 报文做掩码、丢弃与重组。
//!
//! # 模块定位（Why）
//! - 网关需要在不反序列化的前提下改写报文：原地掩码不改变长度，直接作用在源缓冲上；
//!   需要增删字节的改写则复制到新缓冲，并级联修正所有祖先 LEN 前缀；
//! - “决定改什么”与“怎么改字节”严格分离：规划器只产出 [`MutationPlan`]，
//!   校验器审核后，[`ReframeWriter`] 才执行，执行期不再做策略判断。
//!
//! # 结构概览（How）
//! - [`span`] / [`resource_attr`]：值区间选择器，把路径命中转换为 `(offset, length)`；
//! - [`policy`]：规则串编译与 `ArcSwap` 热替换的策略快照；
//! - [`planner`]：健康检查丢弃与策略驱动两种规划器；
//! - [`plan`] / [`validator`]：变更 IR 及其结构校验；
//! - [`cascade`] / [`reframe`] / [`mask`] / [`integrity`]：LEN 级联重算、两阶段写入、掩码填充与校验和修复；
//! - [`config`]：TOML 与环境变量配置。

pub mod cascade;
pub mod config;
pub mod integrity;
pub mod mask;
pub mod plan;
pub mod planner;
pub mod policy;
pub mod reframe;
pub mod resource_attr;
pub mod span;
pub mod validator;

pub use cascade::{CascadeError, LenCascadeRecalculator, Recalculation, VarintPatch};
pub use config::{AllocatorConfig, ConfigError, GatewayConfig, MaskingConfig};
pub use integrity::{
    Crc32TailIntegrityRepair, Endianness, IntegrityError, IntegrityRepair, NoopIntegrityRepair,
};
pub use mask::{
    LaneMaskWriter, MaskError, MaskWriter, MaskWriterMode, MaskWriterSelection, ScalarMaskWriter,
    select_mask_writer,
};
pub use plan::{
    InplaceMaskOp, LengthDelta, MutationPlan, MutationPlanBuilder, PlanMode, PlanOp,
};
pub use planner::{
    DecisionAction, HealthcheckSuccessDropPlanner, MutationPlanner, PlanningScratch,
    PolicyDecision, PolicyDrivenMutationPlanner,
};
pub use policy::{
    CompiledMaskingRule, CompiledMaskingSnapshot, ControlPlanePolicyProvider,
    EnvControlPlanePolicyProvider, MismatchMode, PolicyActionType, StaticPolicyProvider,
};
pub use reframe::{DefaultReframeWriter, ReframeError, ReframeResult, ReframeWriter};
pub use resource_attr::ResourceAttributeSpanSelector;
pub use span::{
    CompiledPathFirstMatchSelector, SelectorError, ValueSpanCollector, ValueSpanSelector,
};
pub use validator::{MutationPlanValidator, ValidationError, ValidationResult};
