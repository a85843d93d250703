use footprint_core::config::{AppConfig, BackendKind, LogConfig};
use footprint_core::store::port::{CandleAnalytics, CandleReader};
use footprint_store::{open_reader, open_store};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_CONFIG_FILE: &str = "footprint";
const ENV_PREFIX: &str = "FOOTPRINT";

/// # Summary
/// 加载配置：默认值 < 配置文件 < 环境变量。
///
/// # Arguments
/// * `path`: 配置文件路径（不含扩展名亦可），文件不存在时忽略。
///
/// # Returns
/// 环境变量以 `FOOTPRINT__` 为前缀、`__` 分隔层级，例如 `FOOTPRINT__STORE__BACKEND=block`。
fn load_config(path: &str) -> Result<AppConfig, config::ConfigError> {
    config::Config::builder()
        .add_source(config::File::with_name(path).required(false))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        )
        .build()?
        .try_deserialize()
}

/// # Summary
/// 初始化全局日志。
///
/// # Logic
/// 1. `RUST_LOG` 优先，否则使用配置中的过滤规则。
/// 2. 配置了 `dir` 时额外按天滚动写文件，返回的 guard 须存活到进程退出。
fn init_tracing(log: &LogConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));

    let (file_layer, guard) = match &log.dir {
        Some(dir) => {
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "footprint.log"));
            let layer = tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    guard
}

/// # Summary
/// 应用启动入口，只负责装配。
///
/// # Logic
/// 1. 加载配置并初始化日志。
/// 2. 按配置打开存储后端并做健康检查。
/// 3. 关系型后端额外通过只读实例输出一次存储概况。
/// 4. 等待退出信号，落盘并关闭存储。
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());
    let app_config = load_config(&path)?;
    let _guard = init_tracing(&app_config.log);
    info!(config = %path, backend = %app_config.store.backend, "Footprint store starting...");

    let store = open_store(&app_config.store).await?;
    let health = store.health_check().await?;
    if health.healthy {
        info!(backend = %health.backend, detail = %health.detail, "Store is healthy");
    } else {
        warn!(backend = %health.backend, detail = %health.detail, "Store reported unhealthy");
    }

    if app_config.store.backend == BackendKind::Relational {
        let reader = open_reader(&app_config.store);
        match reader.get_storage_summary().await {
            Ok(summary) => info!(
                candles = summary.total_candles,
                series = summary.series,
                databases = summary.databases,
                size_bytes = summary.size_bytes,
                earliest = ?summary.earliest,
                latest = ?summary.latest,
                "Storage summary"
            ),
            Err(e) => warn!(error = %e, "Failed to read storage summary"),
        }
        reader.close().await?;
    }

    info!("Store ready. Waiting for signals...");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Flushing...");

    store.flush().await?;
    store.close().await?;
    info!("Footprint store stopped");
    Ok(())
}
