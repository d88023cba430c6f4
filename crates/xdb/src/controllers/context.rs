use crate::config::Config;
use crate::controllers::{
    monitor::{MonitorAgent, PrometheusOperatorAgent},
    scheduler::{BackupScheduler, CronScheduler},
};
use crate::registry::{DockerHub, ImageRegistry};
use crate::storage::{OsmDialer, StorageDialer};
use crate::util::{errors::Error, metrics::Metrics, patch::RetryPolicy};
use chrono::{DateTime, Utc};
use kube::{
    client::Client,
    runtime::events::{Event, EventType, Recorder, Reporter},
    Resource,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

pub const REPORTER: &str = "xdb-operator";

/// State shared between the controllers and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
}

/// State wrapper around the controller outputs for the web server
impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    /// Create a Context that can update State
    pub fn to_context(&self, client: Client, config: Config, integrations: Integrations) -> Result<Arc<Context>, Error> {
        let metrics = Metrics::default()
            .register(&self.registry)
            .map_err(Error::MetricsError)?;
        Ok(Arc::new(Context {
            recorder: Recorder::new(client.clone(), Reporter::from(REPORTER)),
            client,
            config,
            metrics,
            diagnostics: self.diagnostics.clone(),
            scheduler: integrations.scheduler,
            monitor: integrations.monitor,
            storage: integrations.storage,
            registry: integrations.registry,
        }))
    }
}

/// Collaborators the reconcilers call out to.
#[derive(Clone)]
pub struct Integrations {
    pub scheduler: Arc<dyn BackupScheduler>,
    pub monitor: Arc<dyn MonitorAgent>,
    pub storage: Arc<dyn StorageDialer>,
    pub registry: Arc<dyn ImageRegistry>,
}

impl Integrations {
    pub fn new(client: &Client) -> Self {
        Self {
            scheduler: Arc::new(CronScheduler::new(client.clone())),
            monitor: Arc::new(PrometheusOperatorAgent::new(client.clone())),
            storage: Arc::new(OsmDialer),
            registry: Arc::new(DockerHub::default()),
        }
    }
}

/// Context for our reconcilers
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    pub config: Config,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    pub recorder: Recorder,
    pub scheduler: Arc<dyn BackupScheduler>,
    pub monitor: Arc<dyn MonitorAgent>,
    pub storage: Arc<dyn StorageDialer>,
    pub registry: Arc<dyn ImageRegistry>,
}

impl Context {
    pub fn retry(&self) -> RetryPolicy {
        self.config.retry_policy()
    }

    /// Publishes an event on `obj`. Failing to publish is logged and otherwise ignored.
    pub async fn publish<K>(&self, obj: &K, type_: EventType, reason: &str, note: impl Into<String>)
    where
        K: Resource<DynamicType = ()>,
    {
        let event = Event {
            type_,
            reason: reason.into(),
            note: Some(note.into()),
            action: reason.into(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &obj.object_ref(&())).await {
            warn!("failed to publish {} event: {}", reason, e);
        }
    }

    pub async fn normal<K>(&self, obj: &K, reason: &str, note: impl Into<String>)
    where
        K: Resource<DynamicType = ()>,
    {
        self.publish(obj, EventType::Normal, reason, note).await
    }

    pub async fn warning<K>(&self, obj: &K, reason: &str, note: impl Into<String>)
    where
        K: Resource<DynamicType = ()>,
    {
        self.publish(obj, EventType::Warning, reason, note).await
    }

    pub async fn touch(&self) {
        self.diagnostics.write().await.last_event = Utc::now();
    }
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self { last_event: Utc::now() }
    }
}
