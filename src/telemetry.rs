//! 日志与追踪系统
//! 初始化结构化日志和指标收集

use crate::config::AppConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// 初始化日志与追踪系统
///
/// 日志写到 stderr，stdout 留给执行报告。
pub fn init_telemetry(config: &AppConfig) {
    // RUST_LOG 优先于配置
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let log_layer = match config.logging.format.to_lowercase().as_str() {
        "json" => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
            .boxed(),
        "pretty" => tracing_subscriber::fmt::layer()
            .pretty()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed(),
        _ => tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(log_layer)
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        level = %config.logging.level,
        format = %config.logging.format,
        "Telemetry initialized"
    );
}

/// 初始化指标
///
/// 只登记描述；是否安装 recorder 由嵌入方决定，未安装时指标调用为空操作。
pub fn init_metrics() {
    metrics::describe_counter!(
        "fleet_secret_fetches_total",
        "Credential fetches issued to the secret backend"
    );
    metrics::describe_counter!("fleet_relays_opened_total", "Relay channels opened through the bastion");
    metrics::describe_counter!("fleet_relays_refused_total", "Relay channels refused by the bastion");
    metrics::describe_counter!("fleet_host_results_total", "Per-host results by outcome");
    metrics::describe_histogram!(
        "fleet_command_duration_seconds",
        metrics::Unit::Seconds,
        "Remote command duration including the second-hop handshake"
    );
    tracing::debug!("Metrics initialized");
}
