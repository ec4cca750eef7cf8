/// binlog2sql 실행 파일
///
/// 설정은 `BINLOG2SQL_CONFIG`(JSON 파일 경로)가 있으면 그 파일에서,
/// 없으면 환경 변수에서 읽습니다. 생성된 SQL은 stdout(또는 대상 DB)으로,
/// 로그는 stderr로 출력됩니다.
use rust_binlog2sql::config::Binlog2SqlConfig;
use rust_binlog2sql::connection::MySqlConnection;
use rust_binlog2sql::mapping::load_mapping_file;
use rust_binlog2sql::sink::{MySqlSink, SqlSink, StdoutSink};
use rust_binlog2sql::statement::MapperRegistry;
use rust_binlog2sql::stream_driver::{warn_on_risky_config, StreamDriver};
use std::env;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 초기화
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = match env::var("BINLOG2SQL_CONFIG") {
        Ok(path) => {
            info!("Loading configuration from {}", path);
            Binlog2SqlConfig::from_json_file(path)?
        }
        Err(_) => Binlog2SqlConfig::from_env()?,
    };
    config.validate()?;
    warn_on_risky_config(&config);

    let registry = match &config.mapping_file {
        Some(path) => MapperRegistry::from_mapping_config(load_mapping_file(path)?)?,
        None => MapperRegistry::identity(),
    };

    info!(
        "Connecting to {}:{}",
        config.source.hostname, config.source.port
    );
    let server = MySqlConnection::connect(config.source.clone()).await?;

    let summary = match config.destination.clone() {
        Some(destination) => {
            let sink = MySqlSink::connect(&destination, true).await?;
            let mut driver = StreamDriver::new(config, server, sink, registry)?;
            let summary = driver.run().await?;
            driver.into_sink().disconnect().await?;
            summary
        }
        None => run(config, server, StdoutSink, registry).await?,
    };

    info!("Run summary: {}", serde_json::to_string(&summary)?);
    Ok(())
}

async fn run<K: SqlSink>(
    config: Binlog2SqlConfig,
    server: MySqlConnection,
    sink: K,
    registry: MapperRegistry,
) -> rust_binlog2sql::Result<rust_binlog2sql::RunSummary> {
    let mut driver = StreamDriver::new(config, server, sink, registry)?;
    driver.run().await
}
