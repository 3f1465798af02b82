//! 网关配置：TOML 文件与环境变量两种来源。
//!
//! # 教案式说明
//! - **意图（Why）**：分配器规模与掩码开关需要在部署时调整，而不是重新编译；
//! - **逻辑（How）**：[`GatewayConfig`] 通过 `serde` + `toml` 反序列化，缺省字段取默认值，
//!   随后 [`GatewayConfig::validate`] 做一次结构校验；环境变量路径沿用 `GATEWAY_MASKING_*` 键名，
//!   解析失败时回落到默认值，不报错；
//! - **契约（What）**：通过校验的配置总能构造出分配器，[`AllocatorConfig::build`] 不会因分片数失败。

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use otlpgw_core::{PacketAllocator, SlabPacketAllocator, StripedPacketAllocator, StripingError};

use crate::mask::MaskWriterMode;

pub const ENV_MASKING_ENABLED: &str = "GATEWAY_MASKING_ENABLED";
pub const ENV_MASKING_RULES: &str = "GATEWAY_MASKING_RULES";
pub const ENV_MASKING_MAX_OPS_PER_PACKET: &str = "GATEWAY_MASKING_MAX_OPS_PER_PACKET";
pub const ENV_MASKING_SIMD: &str = "GATEWAY_MASKING_SIMD";

pub const DEFAULT_SLAB_BYTES: usize = 1 << 20;
pub const DEFAULT_SLAB_COUNT: usize = 4;
pub const DEFAULT_MAX_OPS_PER_PACKET: usize = 64;

const MAX_OPS_CEILING: usize = 1 << 16;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse gateway config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("allocator.slab_bytes must be greater than zero")]
    ZeroSlabBytes,
    #[error("allocator.slab_count must be greater than zero")]
    ZeroSlabCount,
    #[error("allocator.shards = {0} is not a power of two")]
    ShardsNotPowerOfTwo(usize),
    #[error("masking.max_ops_per_packet must be at least 1")]
    ZeroMaxOps,
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Toml(_) => "config.parse",
            Self::ZeroSlabBytes => "config.zero_slab_bytes",
            Self::ZeroSlabCount => "config.zero_slab_count",
            Self::ShardsNotPowerOfTwo(_) => "config.shards_not_power_of_two",
            Self::ZeroMaxOps => "config.zero_max_ops",
        }
    }
}

impl From<StripingError> for ConfigError {
    fn from(err: StripingError) -> Self {
        match err {
            StripingError::ShardCountNotPowerOfTwo(shards) => Self::ShardsNotPowerOfTwo(shards),
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub allocator: AllocatorConfig,
    pub masking: MaskingConfig,
}

impl GatewayConfig {
    /// 解析并校验。
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// 分配器取默认值，掩码段来自环境变量。
    pub fn from_env_map(env: &HashMap<String, String>) -> Self {
        Self {
            allocator: AllocatorConfig::default(),
            masking: MaskingConfig::from_env_map(env),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.allocator.validate()?;
        if self.masking.max_ops_per_packet == 0 {
            return Err(ConfigError::ZeroMaxOps);
        }
        Ok(())
    }
}

/// `[allocator]` 段。`shards == 1` 时使用单个 slab 分配器。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AllocatorConfig {
    pub slab_bytes: usize,
    /// 单分片内的 slab 数。
    pub slab_count: usize,
    pub shards: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            slab_bytes: DEFAULT_SLAB_BYTES,
            slab_count: DEFAULT_SLAB_COUNT,
            shards: 1,
        }
    }
}

impl AllocatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slab_bytes == 0 {
            return Err(ConfigError::ZeroSlabBytes);
        }
        if self.slab_count == 0 {
            return Err(ConfigError::ZeroSlabCount);
        }
        if !self.shards.is_power_of_two() {
            return Err(ConfigError::ShardsNotPowerOfTwo(self.shards));
        }
        Ok(())
    }

    pub fn build(&self) -> Result<Arc<dyn PacketAllocator>, ConfigError> {
        self.validate()?;
        if self.shards == 1 {
            return Ok(Arc::new(SlabPacketAllocator::with_slabs(
                self.slab_bytes,
                self.slab_count,
            )));
        }
        let striped = StripedPacketAllocator::new(self.shards, self.slab_bytes, self.slab_count)?;
        tracing::debug!(
            shards = self.shards,
            slab_bytes = self.slab_bytes,
            slab_count = self.slab_count,
            "striped packet allocator built"
        );
        Ok(Arc::new(striped))
    }
}

/// `[masking]` 段。
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MaskingConfig {
    pub enabled: bool,
    /// `;` 分隔的规则串，语法见 [`crate::policy`]。
    pub rules: String,
    pub max_ops_per_packet: usize,
    pub simd: MaskWriterMode,
}

impl Default for MaskingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rules: String::new(),
            max_ops_per_packet: DEFAULT_MAX_OPS_PER_PACKET,
            simd: MaskWriterMode::Auto,
        }
    }
}

impl MaskingConfig {
    /// 缺失或空白的键取默认值；`enabled` 只认 `true`（大小写不敏感）；
    /// `max_ops_per_packet` 夹到 `[1, 65536]`，无法解析时取默认值。
    pub fn from_env_map(env: &HashMap<String, String>) -> Self {
        let defaults = Self::default();
        Self {
            enabled: non_blank(env, ENV_MASKING_ENABLED)
                .map_or(defaults.enabled, |raw| raw.eq_ignore_ascii_case("true")),
            rules: non_blank(env, ENV_MASKING_RULES).map_or(defaults.rules, str::to_owned),
            max_ops_per_packet: non_blank(env, ENV_MASKING_MAX_OPS_PER_PACKET)
                .map_or(defaults.max_ops_per_packet, |raw| {
                    parse_clamped(raw, defaults.max_ops_per_packet, 1, MAX_OPS_CEILING)
                }),
            simd: non_blank(env, ENV_MASKING_SIMD).map_or(defaults.simd, MaskWriterMode::parse),
        }
    }
}

fn non_blank<'a>(env: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    env.get(key).map(|raw| raw.trim()).filter(|raw| !raw.is_empty())
}

fn parse_clamped(raw: &str, default: usize, min: usize, max: usize) -> usize {
    match raw.parse::<i64>() {
        Ok(parsed) if parsed < min as i64 => min,
        Ok(parsed) => usize::try_from(parsed).map_or(max, |value| value.min(max)),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn empty_env_yields_defaults() {
        let config = MaskingConfig::from_env_map(&HashMap::new());
        assert_eq!(config, MaskingConfig::default());
        assert!(!config.enabled);
        assert_eq!(config.max_ops_per_packet, 64);
    }

    #[test]
    fn env_values_are_parsed_and_clamped() {
        let config = MaskingConfig::from_env_map(&env(&[
            (ENV_MASKING_ENABLED, " TRUE "),
            (ENV_MASKING_RULES, "r|ALL|DROP|resource.attributes.x"),
            (ENV_MASKING_MAX_OPS_PER_PACKET, "-3"),
            (ENV_MASKING_SIMD, "Off"),
        ]));
        assert!(config.enabled);
        assert_eq!(config.rules, "r|ALL|DROP|resource.attributes.x");
        assert_eq!(config.max_ops_per_packet, 1);
        assert_eq!(config.simd, MaskWriterMode::Off);

        let fallback = MaskingConfig::from_env_map(&env(&[
            (ENV_MASKING_ENABLED, "yes"),
            (ENV_MASKING_MAX_OPS_PER_PACKET, "many"),
        ]));
        assert!(!fallback.enabled);
        assert_eq!(fallback.max_ops_per_packet, DEFAULT_MAX_OPS_PER_PACKET);
    }

    #[test]
    fn validation_rejects_bad_allocator_shapes() {
        let mut allocator = AllocatorConfig::default();
        assert!(allocator.validate().is_ok());

        allocator.shards = 3;
        let err = allocator.validate().unwrap_err();
        assert_eq!(err.code(), "config.shards_not_power_of_two");

        allocator.shards = 2;
        allocator.slab_bytes = 0;
        assert_eq!(allocator.validate().unwrap_err().code(), "config.zero_slab_bytes");
    }

    #[test]
    fn striped_allocator_is_built_for_multiple_shards() {
        let allocator = AllocatorConfig {
            slab_bytes: 256,
            slab_count: 1,
            shards: 2,
        }
        .build()
        .expect("valid config");
        assert_eq!(allocator.stats().alloc_count, 0);
    }
}
