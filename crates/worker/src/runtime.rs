//! Wires configuration, Postgres, Redis and the pipelines into running tasks.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use newsrelay_infra::channel::{RedisStreamSettings, RedisStreamsChannel};
use newsrelay_infra::pipelines::{
    ArticleCollector, BusinessOperation, CdcConsumer, IndexDocument, RelayRoute, UpsertRow,
};
use newsrelay_infra::source::{HttpPageSource, HttpSourceSettings};
use newsrelay_infra::store::{PostgresRowStore, RowStore};
use newsrelay_infra::workers::{CdcWorker, CdcWorkerConfig, WorkerHandle};
use newsrelay_infra::{DeadLetterPublisher, OperationRegistry, RelayConfig, RelayStreamConfig};

use crate::cli::{Cli, Command, Pipeline};

pub async fn run(cli: Cli) -> Result<()> {
    let mut config = RelayConfig::from_env().context("loading configuration")?;
    if let Some(format) = cli.log_format {
        config.log_format = format;
    }
    newsrelay_observability::init(config.log_format);

    match cli.command {
        Command::Collect { date } => {
            collect(&config, date.unwrap_or_else(|| Utc::now().date_naive())).await
        }
        Command::Relay { pipeline } => relay(&config, pipeline).await,
    }
}

async fn collect(config: &RelayConfig, date: NaiveDate) -> Result<()> {
    let pool = connect_pool(config).await?;
    let store = postgres_store(&pool, &config.article_relay.source_table).await?;

    let mut source_settings = HttpSourceSettings::new(config.require_source_url()?);
    source_settings.api_key = config.source.api_key.clone();
    source_settings.timeout = config.source.timeout;
    let source = HttpPageSource::new(source_settings)?;

    let collector = ArticleCollector::new(source, store, config.collection.clone());
    match collector.collect(date).await {
        Ok(report) => {
            info!(
                %date,
                total_count = report.total_count,
                pages = report.pages,
                inserted = report.inserted,
                invalid = report.invalid,
                "collection finished"
            );
            Ok(())
        }
        Err(err) => {
            error!(%date, unresolved_pages = ?err.unresolved_pages(), error = %err, "collection failed");
            Err(err.into())
        }
    }
}

async fn relay(config: &RelayConfig, pipeline: Pipeline) -> Result<()> {
    let pool = connect_pool(config).await?;
    let mut workers = Vec::new();

    if pipeline.includes_article() {
        let relay = &config.article_relay;
        let target: Arc<dyn RowStore> = Arc::new(postgres_store(&pool, &relay.target_table).await?);
        let operation = Arc::new(UpsertRow::new("article-relay", target.clone()));
        workers.push(start_relay(config, "article-relay", relay, target, operation).await?);
    }

    if pipeline.includes_analysis() {
        let relay = &config.analysis_relay;
        let index: Arc<dyn RowStore> = Arc::new(postgres_store(&pool, &relay.target_table).await?);
        let operation = Arc::new(
            IndexDocument::new("analysis-index", index.clone()).with_fields(config.analysis_fields.clone()),
        );
        workers.push(start_relay(config, "analysis-relay", relay, index, operation).await?);
    }

    info!(workers = workers.len(), "relay workers running");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested");

    for worker in workers {
        worker.shutdown().await;
    }
    pool.close().await;
    Ok(())
}

async fn start_relay(
    config: &RelayConfig,
    name: &str,
    relay: &RelayStreamConfig,
    guard_store: Arc<dyn RowStore>,
    operation: Arc<dyn BusinessOperation>,
) -> Result<WorkerHandle> {
    let consumer_config = &config.consumer;
    let settings = RedisStreamSettings::new(
        &relay.stream,
        &consumer_config.group,
        format!("{}-{name}", consumer_config.name),
    )
    .with_block(consumer_config.block)
    .with_dlq_partitions(consumer_config.dlq_partitions);

    let channel = Arc::new(
        RedisStreamsChannel::connect(&config.redis_url, settings)
            .await
            .with_context(|| format!("connecting {name} to stream {}", relay.stream))?,
    );

    let routes = OperationRegistry::new().with(RelayRoute::for_table(
        &relay.source_table,
        relay.identity.clone(),
        guard_store,
        operation,
    ));
    let consumer = CdcConsumer::new(
        name,
        routes,
        DeadLetterPublisher::new(channel.clone(), &relay.dlq_stream),
        consumer_config.operation_retry,
    );

    info!(
        worker = name,
        stream = %relay.stream,
        dead_letters = %relay.dlq_stream,
        target = %relay.target_table,
        "starting relay worker"
    );
    Ok(CdcWorker::spawn(
        consumer,
        channel,
        CdcWorkerConfig::default()
            .with_name(name)
            .with_batch_size(consumer_config.batch_size),
    ))
}

async fn connect_pool(config: &RelayConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(config.require_database_url()?)
        .await
        .context("connecting to Postgres")
}

async fn postgres_store(pool: &PgPool, table: &str) -> Result<PostgresRowStore> {
    let store = PostgresRowStore::new(pool.clone(), table)?;
    store
        .ensure_table()
        .await
        .with_context(|| format!("preparing table {table}"))?;
    Ok(store)
}
