use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use courier_infra::broker::RedisStreamsBroker;
use courier_infra::{CourierConfig, NotificationDispatcher, RpcClient, RpcClientConfig};
use courier_messaging::{Broker, InMemoryBroker};

/// Longest deadline a request may ask for.
pub const MAX_RPC_TIMEOUT: Duration = Duration::from_secs(120);

/// Broker-facing handles shared by all handlers.
#[derive(Debug)]
pub struct AppServices {
    pub rpc: Arc<RpcClient>,
    pub notifications: NotificationDispatcher,
    pub default_timeout: Duration,
}

impl AppServices {
    /// Connect the RPC client and the dispatcher to `broker`. Blocks while queues
    /// are declared.
    pub fn connect(broker: Arc<dyn Broker>, config: &CourierConfig) -> anyhow::Result<Self> {
        let rpc_config = RpcClientConfig::default()
            .with_name("gateway")
            .with_work_queue(&config.work_queue)
            .with_default_timeout(config.rpc_timeout);

        let rpc = RpcClient::connect(broker.clone(), rpc_config).context("failed to start rpc client")?;
        let notifications = NotificationDispatcher::new(broker, &config.notification_queue)
            .context("failed to declare notification queue")?;

        Ok(Self {
            rpc: Arc::new(rpc),
            notifications,
            default_timeout: config.rpc_timeout.min(MAX_RPC_TIMEOUT),
        })
    }
}

/// Pick the broker from configuration and connect.
pub fn build_services(config: &CourierConfig) -> anyhow::Result<AppServices> {
    let broker: Arc<dyn Broker> = match config.redis_url.as_deref() {
        Some(url) => {
            tracing::info!(redis_url = %url, "using redis streams broker");
            Arc::new(RedisStreamsBroker::new(url).context("invalid redis url")?)
        }
        None => {
            tracing::warn!("COURIER_REDIS_URL not set; using in-process broker (no remote workers)");
            Arc::new(InMemoryBroker::new())
        }
    };

    AppServices::connect(broker, config)
}
