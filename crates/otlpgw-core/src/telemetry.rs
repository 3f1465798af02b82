//! 进程级 `tracing` 订阅器的安装入口。
//!
//! # 教案式说明
//! - **意图（Why）**：网关核心的各组件只通过 `tracing` 宏输出结构化日志，订阅器由宿主进程在启动时安装一次；
//! - **逻辑（How）**：组装 `registry + EnvFilter + fmt` 三层，`RUST_LOG` 优先，缺省时使用调用方给出的指令；
//! - **契约（What）**：重复安装返回 [`TelemetryError::AlreadyInstalled`]，外部已设置全局订阅器时返回
//!   [`TelemetryError::SetGlobalSubscriber`]，两者都不会 panic。

use std::sync::OnceLock;

use thiserror::Error;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

static INSTALLED: OnceLock<String> = OnceLock::new();

/// 安装过程可能出现的错误。
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// `install_tracing` 已经成功执行过。
    #[error("tracing subscriber already installed with directive `{0}`")]
    AlreadyInstalled(String),
    /// 默认过滤指令无法解析。
    #[error("invalid filter directive `{directive}`: {source}")]
    InvalidDirective {
        directive: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },
    /// 全局订阅器已被外部设置。
    #[error("failed to set global subscriber: {0}")]
    SetGlobalSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// 安装全局订阅器；`default_directive` 在 `RUST_LOG` 未设置时生效（如 `"info,otlpgw_mutate=debug"`）。
pub fn install_tracing(default_directive: &str) -> Result<(), TelemetryError> {
    if let Some(existing) = INSTALLED.get() {
        return Err(TelemetryError::AlreadyInstalled(existing.clone()));
    }
    let filter = build_env_filter(default_directive)?;
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());
    tracing::subscriber::set_global_default(subscriber)?;
    let _ = INSTALLED.set(default_directive.to_owned());
    Ok(())
}

/// 是否已经通过本模块安装过订阅器。
pub fn is_installed() -> bool {
    INSTALLED.get().is_some()
}

fn build_env_filter(default_directive: &str) -> Result<EnvFilter, TelemetryError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(default_directive).map_err(|source| {
            TelemetryError::InvalidDirective {
                directive: default_directive.to_owned(),
                source,
            }
        }),
    }
}
