//! 日志初始化模块
//!
//! 在进程启动时安装一次全局 tracing 订阅者，此后各组件直接通过
//! tracing 宏输出结构化日志，不依赖惰性初始化的全局状态。

use anyhow::Result;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::ObservabilityConfig;

/// 初始化日志订阅者
///
/// 级别解析顺序：`RUST_LOG` 环境过滤器 > 配置中的 log_level > info。
/// 格式由 `log_format` 决定：json（结构化，供日志采集）或
/// pretty（人类可读，本地开发）。
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = if config.log_format == "json" {
        fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .boxed()
    } else {
        fmt::layer().with_target(true).with_ansi(true).boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}
