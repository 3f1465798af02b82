//! 控制面策略：掩码/丢弃规则的编译与热替换。
//!
//! # 教案式说明
//! - **意图（Why）**：规则由控制面以字符串形式下发，数据面每个报文都要读取；读取必须无锁，
//!   刷新必须原子，读者永远看不到“一半新一半旧”的规则集；
//! - **逻辑（How）**：规则在刷新时一次性编译为不可变的 [`CompiledMaskingSnapshot`]，
//!   通过 [`ArcSwap`] 整体替换；读者每个报文 `load_full` 一次并持有到规划结束；
//! - **规则语法（What）**：`;` 分隔规则，`|` 分隔字段：
//!   `ruleId|signal|action|sourcePath|redactionToken|priority|mismatchMode|enabled`，
//!   畸形规则记录告警后跳过，从不导致整体失败。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;

use otlpgw_core::SignalKind;
use otlpgw_wire::{
    BytecodeCompiledPathEvaluator, CompiledPathEvaluator, OtlpPathCompiler, PathCompiler,
    PathStringPool, SchemaId,
};

use crate::config::MaskingConfig;
use crate::resource_attr::ResourceAttributeSpanSelector;
use crate::span::{CompiledPathFirstMatchSelector, ValueSpanSelector};

/// 未声明或无法解析时的规则优先级。
pub const DEFAULT_RULE_PRIORITY: i32 = 100;

const RESOURCE_ATTRIBUTE_PREFIXES: [&str; 4] = [
    "resource.attributes.",
    "resourcespans.resource.attributes.",
    "resourcemetrics.resource.attributes.",
    "resourcelogs.resource.attributes.",
];

/// 规则动作。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PolicyActionType {
    Drop,
    RedactMask,
}

impl PolicyActionType {
    /// `DROP`、`REDACT_MASK`、`MASK`（大小写不敏感），其它返回 `None`。
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "DROP" => Some(Self::Drop),
            "REDACT_MASK" | "MASK" => Some(Self::RedactMask),
            _ => None,
        }
    }
}

/// 令牌长度与命中区间不一致时的处理方式。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum MismatchMode {
    /// 跳过该区间。
    #[default]
    Skip,
    /// 整个报文改为丢弃。
    FailClosed,
}

impl MismatchMode {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "fail_closed" | "fail-closed" | "closed" => Self::FailClosed,
            _ => Self::Skip,
        }
    }
}

/// 编译后的单条规则，构造后不可变。
#[derive(Clone)]
pub struct CompiledMaskingRule {
    rule_id: Arc<str>,
    priority: i32,
    enabled: bool,
    signal: Option<SignalKind>,
    action: PolicyActionType,
    redaction_token: Option<Arc<[u8]>>,
    mismatch_mode: MismatchMode,
    selector: Arc<dyn ValueSpanSelector>,
    mask_reason: Arc<str>,
    drop_reason: Arc<str>,
    mismatch_reason: Arc<str>,
}

impl CompiledMaskingRule {
    /// 默认作用于全部信号，优先级 [`DEFAULT_RULE_PRIORITY`]，`SKIP` 模式，无令牌。
    pub fn new(
        rule_id: impl Into<Arc<str>>,
        action: PolicyActionType,
        selector: Arc<dyn ValueSpanSelector>,
    ) -> Self {
        let rule_id = rule_id.into();
        Self {
            mask_reason: Arc::from(format!("MASK_RULE_{rule_id}")),
            drop_reason: Arc::from(format!("DROP_RULE_{rule_id}")),
            mismatch_reason: Arc::from(format!("MASK_MISMATCH_FAIL_CLOSED_{rule_id}")),
            rule_id,
            priority: DEFAULT_RULE_PRIORITY,
            enabled: true,
            signal: None,
            action,
            redaction_token: None,
            mismatch_mode: MismatchMode::Skip,
            selector,
        }
    }

    /// `None` 表示作用于全部信号。
    #[must_use]
    pub fn with_signal(mut self, signal: Option<SignalKind>) -> Self {
        self.signal = signal;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// 只有 `RedactMask` 规则保留令牌；空令牌视为无令牌。
    #[must_use]
    pub fn with_redaction_token(mut self, token: &[u8]) -> Self {
        self.redaction_token = (self.action == PolicyActionType::RedactMask && !token.is_empty())
            .then(|| Arc::from(token));
        self
    }

    #[must_use]
    pub fn with_mismatch_mode(mut self, mode: MismatchMode) -> Self {
        self.mismatch_mode = mode;
        self
    }

    pub fn rule_id(&self) -> &str {
        &self.rule_id
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn signal(&self) -> Option<SignalKind> {
        self.signal
    }

    pub fn all_signals(&self) -> bool {
        self.signal.is_none()
    }

    pub fn action(&self) -> PolicyActionType {
        self.action
    }

    pub fn redaction_token(&self) -> Option<&Arc<[u8]>> {
        self.redaction_token.as_ref()
    }

    pub fn mismatch_mode(&self) -> MismatchMode {
        self.mismatch_mode
    }

    pub fn selector(&self) -> &dyn ValueSpanSelector {
        self.selector.as_ref()
    }

    pub fn applies_to(&self, signal: SignalKind) -> bool {
        self.signal.is_none_or(|own| own == signal)
    }

    pub(crate) fn mask_reason(&self) -> &Arc<str> {
        &self.mask_reason
    }

    pub(crate) fn drop_reason(&self) -> &Arc<str> {
        &self.drop_reason
    }

    pub(crate) fn mismatch_reason(&self) -> &Arc<str> {
        &self.mismatch_reason
    }
}

impl std::fmt::Debug for CompiledMaskingRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledMaskingRule")
            .field("rule_id", &self.rule_id)
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .field("signal", &self.signal)
            .field("action", &self.action)
            .field("mismatch_mode", &self.mismatch_mode)
            .finish_non_exhaustive()
    }
}

/// 某一时刻生效的完整规则集，按优先级升序排列。
#[derive(Clone, Debug)]
pub struct CompiledMaskingSnapshot {
    revision: u64,
    enabled: bool,
    rules: Vec<CompiledMaskingRule>,
}

impl CompiledMaskingSnapshot {
    /// 规则按优先级稳定排序。
    pub fn new(revision: u64, enabled: bool, mut rules: Vec<CompiledMaskingRule>) -> Self {
        rules.sort_by_key(CompiledMaskingRule::priority);
        Self {
            revision,
            enabled,
            rules,
        }
    }

    /// 关闭状态：修订号 0，无规则。
    pub fn disabled() -> Self {
        Self::new(0, false, Vec::new())
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn rules(&self) -> &[CompiledMaskingRule] {
        &self.rules
    }
}

/// 数据面读取当前规则集的入口。
pub trait ControlPlanePolicyProvider: Send + Sync {
    fn active_snapshot(&self) -> Arc<CompiledMaskingSnapshot>;
}

/// 固定快照，适合测试与嵌入场景。
#[derive(Clone, Debug)]
pub struct StaticPolicyProvider {
    snapshot: Arc<CompiledMaskingSnapshot>,
}

impl StaticPolicyProvider {
    pub fn new(snapshot: CompiledMaskingSnapshot) -> Self {
        Self {
            snapshot: Arc::new(snapshot),
        }
    }
}

impl ControlPlanePolicyProvider for StaticPolicyProvider {
    fn active_snapshot(&self) -> Arc<CompiledMaskingSnapshot> {
        Arc::clone(&self.snapshot)
    }
}

/// 从掩码配置（环境变量或 TOML）编译规则的提供者。
pub struct EnvControlPlanePolicyProvider {
    snapshot: ArcSwap<CompiledMaskingSnapshot>,
    last_revision: AtomicU64,
    compiler: OtlpPathCompiler,
    evaluator: Arc<dyn CompiledPathEvaluator>,
}

impl Default for EnvControlPlanePolicyProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvControlPlanePolicyProvider {
    /// 初始为关闭状态。
    pub fn new() -> Self {
        let pool = Arc::new(PathStringPool::new());
        Self {
            snapshot: ArcSwap::from_pointee(CompiledMaskingSnapshot::disabled()),
            last_revision: AtomicU64::new(0),
            compiler: OtlpPathCompiler::new(Arc::clone(&pool)),
            evaluator: Arc::new(BytecodeCompiledPathEvaluator::new(pool)),
        }
    }

    pub fn from_config(config: &MaskingConfig) -> Self {
        let provider = Self::new();
        provider.refresh(config);
        provider
    }

    /// 读取进程环境变量（`GATEWAY_MASKING_*`）。
    pub fn from_environment() -> Self {
        let env: std::collections::HashMap<String, String> = std::env::vars().collect();
        Self::from_config(&MaskingConfig::from_env_map(&env))
    }

    /// 编译新快照并原子替换，返回新快照。
    pub fn refresh(&self, config: &MaskingConfig) -> Arc<CompiledMaskingSnapshot> {
        let snapshot = if config.enabled {
            let rules = self.compile_rules(&config.rules);
            Arc::new(CompiledMaskingSnapshot::new(self.next_revision(), true, rules))
        } else {
            Arc::new(CompiledMaskingSnapshot::disabled())
        };
        tracing::info!(
            revision = snapshot.revision(),
            enabled = snapshot.enabled(),
            rules = snapshot.rules().len(),
            "masking policy refreshed"
        );
        self.snapshot.store(Arc::clone(&snapshot));
        snapshot
    }

    /// 解析并编译规则字符串；畸形规则被跳过，结果未排序。
    pub fn compile_rules(&self, raw: &str) -> Vec<CompiledMaskingRule> {
        raw.split(';')
            .map(str::trim)
            .filter(|def| !def.is_empty())
            .filter_map(|def| self.compile_rule(def))
            .collect()
    }

    fn compile_rule(&self, def: &str) -> Option<CompiledMaskingRule> {
        let parts: Vec<&str> = def.split('|').collect();
        if parts.len() < 4 {
            tracing::warn!(rule = def, "skipping malformed masking rule");
            return None;
        }
        let rule_id = match parts[0].trim() {
            "" => format!("rule-{}", crc32fast::hash(def.as_bytes())),
            id => id.to_owned(),
        };
        let signal = SignalKind::parse(parts[1]);
        let Some(action) = PolicyActionType::parse(parts[2]) else {
            tracing::warn!(rule_id = rule_id.as_str(), action = parts[2], "skipping rule with unsupported action");
            return None;
        };
        let source_path = parts[3].trim();
        let token = parts.get(4).copied().unwrap_or("");
        let priority = parts
            .get(5)
            .and_then(|raw| raw.trim().parse::<i32>().ok())
            .unwrap_or(DEFAULT_RULE_PRIORITY);
        let mismatch_mode = parts.get(6).map_or(MismatchMode::Skip, |raw| MismatchMode::parse(raw));
        let enabled = parts
            .get(7)
            .map(|raw| raw.trim())
            .is_none_or(|raw| raw.is_empty() || raw.eq_ignore_ascii_case("true"));
        if !enabled {
            tracing::debug!(rule_id = rule_id.as_str(), "masking rule disabled");
            return None;
        }

        let Some(selector) = self.build_selector(&rule_id, source_path, signal) else {
            tracing::warn!(rule_id = rule_id.as_str(), path = source_path, "skipping rule with unsupported path");
            return None;
        };
        Some(
            CompiledMaskingRule::new(rule_id, action, selector)
                .with_signal(signal)
                .with_priority(priority)
                .with_redaction_token(token.as_bytes())
                .with_mismatch_mode(mismatch_mode),
        )
    }

    fn build_selector(
        &self,
        rule_id: &str,
        source_path: &str,
        signal: Option<SignalKind>,
    ) -> Option<Arc<dyn ValueSpanSelector>> {
        if let Some(key) = resource_attribute_key(source_path) {
            return Some(Arc::new(ResourceAttributeSpanSelector::new(key)));
        }
        let signal = signal?;
        match self.compiler.compile(source_path, &SchemaId::otlp_v1(), signal) {
            Ok(path) => Some(Arc::new(CompiledPathFirstMatchSelector::new(
                Arc::clone(&self.evaluator),
                path,
            ))),
            Err(err) => {
                tracing::warn!(rule_id, code = err.code(), position = err.position, error = %err, "rule path failed to compile");
                None
            }
        }
    }

    /// 墙钟毫秒数，保证严格单调递增。
    fn next_revision(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
        let previous = self
            .last_revision
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last.saturating_add(1)))
            })
            .unwrap_or(now);
        now.max(previous.saturating_add(1))
    }
}

impl ControlPlanePolicyProvider for EnvControlPlanePolicyProvider {
    fn active_snapshot(&self) -> Arc<CompiledMaskingSnapshot> {
        self.snapshot.load_full()
    }
}

/// 资源属性前缀（大小写不敏感）之后的原样键；键为空时返回 `None`。
fn resource_attribute_key(path: &str) -> Option<&str> {
    let path = path.trim();
    RESOURCE_ATTRIBUTE_PREFIXES.iter().find_map(|prefix| {
        let head = path.get(..prefix.len())?;
        if !head.eq_ignore_ascii_case(prefix) {
            return None;
        }
        let key = &path[prefix.len()..];
        (!key.trim().is_empty()).then_some(key)
    })
}
