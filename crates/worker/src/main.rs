//! Worker process: serves OCR jobs and delivers notifications.

mod http;

use std::sync::Arc;

use anyhow::Context;

use courier_infra::broker::RedisStreamsBroker;
use courier_infra::capability::RECOGNIZE;
use courier_infra::notify::NotificationConsumerConfig;
use courier_infra::{
    CapabilityRouter, CourierConfig, Mailer, NotificationConsumer, OcrCapability, RpcWorker,
    RpcWorkerConfig,
};
use courier_messaging::Broker;

use crate::http::{HttpMailer, HttpRecognizer, LogMailer};

fn main() -> anyhow::Result<()> {
    courier_observability::init();

    let config = CourierConfig::from_env().context("invalid configuration")?;
    let redis_url = config.require_redis_url()?;
    let broker: Arc<dyn Broker> =
        Arc::new(RedisStreamsBroker::new(redis_url).context("invalid redis url")?);

    let ocr_endpoint = config
        .ocr_endpoint
        .as_deref()
        .context("COURIER_OCR_ENDPOINT must be set")?;
    let router = CapabilityRouter::new().with(
        RECOGNIZE,
        OcrCapability::new(HttpRecognizer::new(ocr_endpoint)?),
    );

    let workers = RpcWorker::new(
        broker.clone(),
        router,
        RpcWorkerConfig::default()
            .with_work_queue(&config.work_queue)
            .with_concurrency(config.worker_concurrency),
    )
    .spawn()?;

    let mailer: Arc<dyn Mailer> = match config.mail_endpoint.as_deref() {
        Some(endpoint) => Arc::new(HttpMailer::new(endpoint)?),
        None => {
            tracing::warn!("COURIER_MAIL_ENDPOINT not set; notifications are only logged");
            Arc::new(LogMailer)
        }
    };
    let notifications = NotificationConsumer::new(
        broker,
        mailer,
        NotificationConsumerConfig::default().with_queue(&config.notification_queue),
    )
    .spawn()?;

    tracing::info!(
        work_queue = %config.work_queue,
        notification_queue = %config.notification_queue,
        concurrency = workers.len(),
        "worker running"
    );

    // Broker loops run on their own threads; this runtime only waits for the signal.
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(tokio::signal::ctrl_c())?;

    tracing::info!("shutdown requested");
    notifications.shutdown();
    workers.shutdown();
    Ok(())
}
