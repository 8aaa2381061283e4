//! Wiring: turn a [`Config`] into a running set of collaborators.

use std::sync::Arc;

use thiserror::Error;

use crate::bus::{InMemoryBus, Publisher};
use crate::config::{Backend, Config, ConfigError};
use crate::outbox::{Outbox, OutboxCallback, OutboxSettings, Sweeper, SweeperThread, SweepStats};
use crate::queue::{DeliveryError, DeliveryStats, InMemoryTaskQueue, QueueError, QueueSettings, QueueWorker};
use crate::store::{InMemoryStore, OptimisticStore, RetryPolicy, Store, StoreError};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// Store, bus, task queue, and outbox built for one backend.
pub struct Infrastructure {
    config: Config,
    store: Arc<dyn Store>,
    bus: Arc<dyn Publisher>,
    memory_bus: Option<InMemoryBus>,
    queue: InMemoryTaskQueue,
    outbox: Arc<Outbox>,
}

impl Infrastructure {
    /// Build the collaborators selected by `config.backend`.
    ///
    /// In-process: [`InMemoryStore`], [`InMemoryBus`], triggers delivered
    /// straight to the outbox. Managed: [`OptimisticStore`] persisted under
    /// the data dir, push delivery to the configured endpoints, triggers
    /// delivered over HTTP to the callback base URL.
    pub fn from_config(config: &Config) -> Result<Self, BackendError> {
        Self::build(config, None)
    }

    /// Like [`Infrastructure::from_config`] with a caller-supplied bus.
    pub fn with_bus(config: &Config, bus: Arc<dyn Publisher>) -> Result<Self, BackendError> {
        Self::build(config, Some(bus))
    }

    fn build(config: &Config, bus: Option<Arc<dyn Publisher>>) -> Result<Self, BackendError> {
        let queue = InMemoryTaskQueue::new(QueueSettings {
            dedup_window: config.dedup_window(),
            retry: RetryPolicy {
                max_attempts: config.max_attempts,
                ..QueueSettings::default().retry
            },
        });

        let store: Arc<dyn Store> = match &config.backend {
            Backend::InProcess => Arc::new(InMemoryStore::new()),
            Backend::Managed { .. } => Arc::new(OptimisticStore::open(config.snapshot_path())?),
        };

        let mut memory_bus = None;
        let bus = match bus {
            Some(bus) => bus,
            None => match &config.backend {
                Backend::InProcess => {
                    let in_memory = InMemoryBus::new();
                    memory_bus = Some(in_memory.clone());
                    Arc::new(in_memory) as Arc<dyn Publisher>
                }
                Backend::Managed { .. } => push_bus(config)?,
            },
        };

        let outbox = Arc::new(
            Outbox::new(Arc::clone(&store), Arc::clone(&bus), Arc::new(queue.clone())).with_settings(
                OutboxSettings {
                    trigger_delay: config.trigger_delay(),
                    ..OutboxSettings::default()
                },
            ),
        );

        match &config.backend {
            Backend::Managed { .. } if cfg!(feature = "http") => {
                queue.set_target(http_target(config)?)?;
            }
            _ => queue.set_target(Arc::new(OutboxCallback::new(&outbox)))?,
        }

        tracing::info!(
            backend = ?config.backend,
            data_dir = %config.data_dir.display(),
            "infrastructure ready"
        );

        Ok(Self {
            config: config.clone(),
            store,
            bus,
            memory_bus,
            queue,
            outbox,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<dyn Publisher> {
        &self.bus
    }

    /// The in-memory bus, when the in-process backend created one.
    pub fn memory_bus(&self) -> Option<&InMemoryBus> {
        self.memory_bus.as_ref()
    }

    pub fn queue(&self) -> &InMemoryTaskQueue {
        &self.queue
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    /// Start the queue worker and the sweeper.
    pub fn spawn_workers(&self) -> Workers {
        Workers {
            queue: self.queue.spawn_worker(self.config.queue_poll_interval()),
            sweeper: Sweeper::new(Arc::clone(&self.outbox), self.config.sweep_grace())
                .spawn(self.config.sweep_interval()),
        }
    }
}

/// Background threads started by [`Infrastructure::spawn_workers`].
pub struct Workers {
    queue: QueueWorker,
    sweeper: SweeperThread,
}

impl Workers {
    pub fn stop(self) -> (DeliveryStats, SweepStats) {
        (self.queue.stop(), self.sweeper.stop())
    }
}

#[cfg(feature = "http")]
fn push_bus(config: &Config) -> Result<Arc<dyn Publisher>, BackendError> {
    use crate::bus::{HttpPushEndpoint, PushPublisher};

    let publisher = config
        .push_endpoints
        .iter()
        .fold(PushPublisher::new(), |publisher, target| {
            publisher.with_endpoint(&target.topic, Arc::new(HttpPushEndpoint::new(&target.url)))
        });
    Ok(Arc::new(publisher))
}

#[cfg(not(feature = "http"))]
fn push_bus(config: &Config) -> Result<Arc<dyn Publisher>, BackendError> {
    if !config.push_endpoints.is_empty() {
        return Err(ConfigError::Unsupported(
            "OUTBOX_PUSH_ENDPOINTS requires the \"http\" feature".into(),
        )
        .into());
    }
    Ok(Arc::new(crate::bus::PushPublisher::new()))
}

#[cfg(feature = "http")]
fn http_target(config: &Config) -> Result<Arc<dyn crate::queue::TaskTarget>, BackendError> {
    Ok(Arc::new(crate::queue::HttpTarget::new(&config.callback_base_url)?))
}

#[cfg(not(feature = "http"))]
fn http_target(_config: &Config) -> Result<Arc<dyn crate::queue::TaskTarget>, BackendError> {
    Err(ConfigError::Unsupported("HTTP trigger delivery requires the \"http\" feature".into()).into())
}
