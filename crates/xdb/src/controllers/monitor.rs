use crate::api::{
    v1alpha1::{MonitorSpec, PrometheusSpec, Xdb},
    AGENT_COREOS_PROMETHEUS, PROMETHEUS_EXPORTER_PORT_NAME,
};
use crate::util::errors::{is_not_found, Error, Result};
use async_trait::async_trait;
use kube::{
    api::{Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ObjectMeta, Patch, PatchParams, PostParams},
    Client, ResourceExt,
};
use serde_json::json;
use tracing::info;

/// Hands database metrics endpoints to a monitoring system.
#[async_trait]
pub trait MonitorAgent: Send + Sync {
    async fn add_monitor(&self, xdb: &Xdb, spec: &MonitorSpec) -> Result<()>;

    async fn delete_monitor(&self, xdb: &Xdb, spec: &MonitorSpec) -> Result<()>;

    async fn update_monitor(&self, xdb: &Xdb, old: Option<&MonitorSpec>, new: Option<&MonitorSpec>) -> Result<()>;
}

/// Manages `ServiceMonitor` objects of the Prometheus operator.
#[derive(Clone)]
pub struct PrometheusOperatorAgent {
    client: Client,
    resource: ApiResource,
}

impl PrometheusOperatorAgent {
    pub fn new(client: Client) -> Self {
        let gvk = GroupVersionKind::gvk("monitoring.coreos.com", "v1", "ServiceMonitor");
        Self {
            client,
            resource: ApiResource::from_gvk(&gvk),
        }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.resource)
    }
}

fn prometheus(spec: &MonitorSpec) -> Result<&PrometheusSpec> {
    if spec.agent != AGENT_COREOS_PROMETHEUS {
        return Err(Error::ValidationError(format!("monitor agent {} is not supported", spec.agent)));
    }
    spec.prometheus
        .as_ref()
        .ok_or_else(|| Error::ValidationError("monitor.prometheus is required".into()))
}

fn monitor_namespace(xdb: &Xdb, prometheus: &PrometheusSpec) -> String {
    prometheus
        .namespace
        .clone()
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| xdb.namespace().unwrap_or_default())
}

/// Desired `ServiceMonitor` scraping the exporter port of `xdb`'s service.
pub fn service_monitor(xdb: &Xdb, prometheus: &PrometheusSpec, resource: &ApiResource) -> DynamicObject {
    let mut endpoint = json!({
        "port": PROMETHEUS_EXPORTER_PORT_NAME,
        "path": xdb.metrics_path(),
    });
    if let Some(interval) = prometheus.interval.as_deref().filter(|i| !i.is_empty()) {
        endpoint["interval"] = json!(interval);
    }

    let mut monitor = DynamicObject::new(&xdb.service_monitor_name(), resource);
    monitor.metadata = ObjectMeta {
        name: Some(xdb.service_monitor_name()),
        namespace: Some(monitor_namespace(xdb, prometheus)),
        labels: prometheus.labels.clone(),
        ..Default::default()
    };
    monitor.data = json!({
        "spec": {
            "selector": { "matchLabels": xdb.offshoot_labels() },
            "namespaceSelector": { "matchNames": [xdb.namespace().unwrap_or_default()] },
            "endpoints": [endpoint],
        }
    });
    monitor
}

#[async_trait]
impl MonitorAgent for PrometheusOperatorAgent {
    async fn add_monitor(&self, xdb: &Xdb, spec: &MonitorSpec) -> Result<()> {
        let prometheus = prometheus(spec)?;
        let desired = service_monitor(xdb, prometheus, &self.resource);
        let namespace = monitor_namespace(xdb, prometheus);
        let api = self.api(&namespace);

        match api.get(&desired.name_any()).await {
            Ok(_) => {
                let patch = json!({
                    "metadata": { "labels": desired.metadata.labels },
                    "spec": desired.data["spec"],
                });
                api.patch(&desired.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
            }
            Err(e) if is_not_found(&e) => {
                api.create(&PostParams::default(), &desired).await?;
                info!("created ServiceMonitor {}/{}", namespace, desired.name_any());
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn delete_monitor(&self, xdb: &Xdb, spec: &MonitorSpec) -> Result<()> {
        let prometheus = prometheus(spec)?;
        let namespace = monitor_namespace(xdb, prometheus);
        match self
            .api(&namespace)
            .delete(&xdb.service_monitor_name(), &DeleteParams::default())
            .await
        {
            Ok(_) => {
                info!("deleted ServiceMonitor {}/{}", namespace, xdb.service_monitor_name());
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_monitor(&self, xdb: &Xdb, old: Option<&MonitorSpec>, new: Option<&MonitorSpec>) -> Result<()> {
        match (old, new) {
            (None, None) => Ok(()),
            (None, Some(new)) => self.add_monitor(xdb, new).await,
            (Some(old), None) => self.delete_monitor(xdb, old).await,
            (Some(old), Some(new)) => {
                let moved = match (old.prometheus.as_ref(), new.prometheus.as_ref()) {
                    (Some(o), Some(n)) => monitor_namespace(xdb, o) != monitor_namespace(xdb, n),
                    _ => true,
                };
                if moved || old.agent != new.agent {
                    // removal from a namespace we may no longer be configured for is best effort
                    let _ = self.delete_monitor(xdb, old).await;
                }
                self.add_monitor(xdb, new).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1alpha1::XdbSpec;
    use crate::fixtures::ApiServer;
    use std::collections::BTreeMap;

    fn monitor(namespace: Option<&str>) -> MonitorSpec {
        MonitorSpec {
            agent: AGENT_COREOS_PROMETHEUS.into(),
            prometheus: Some(PrometheusSpec {
                namespace: namespace.map(String::from),
                labels: Some(BTreeMap::from([("app".to_string(), "kubedb".to_string())])),
                interval: Some("10s".into()),
            }),
        }
    }

    fn xdb() -> Xdb {
        let mut xdb = Xdb::new("db1", XdbSpec::default());
        xdb.metadata.namespace = Some("demo".into());
        xdb
    }

    #[test]
    fn service_monitor_targets_the_exporter() {
        let agent_resource = ApiResource::from_gvk(&GroupVersionKind::gvk("monitoring.coreos.com", "v1", "ServiceMonitor"));
        let spec = monitor(Some("monitoring"));
        let sm = service_monitor(&xdb(), spec.prometheus.as_ref().unwrap(), &agent_resource);
        assert_eq!(sm.name_any(), "kubedb-demo-db1");
        assert_eq!(sm.namespace().as_deref(), Some("monitoring"));
        assert_eq!(sm.data["spec"]["endpoints"][0]["port"], "http");
        assert_eq!(sm.data["spec"]["endpoints"][0]["interval"], "10s");
        assert_eq!(
            sm.data["spec"]["endpoints"][0]["path"],
            "/kubedb.com/v1alpha1/namespaces/demo/xdbs/db1/metrics"
        );
        assert_eq!(sm.data["spec"]["namespaceSelector"]["matchNames"][0], "demo");
        assert_eq!(sm.data["spec"]["selector"]["matchLabels"]["kubedb.com/name"], "db1");
    }

    #[test]
    fn unsupported_agents_are_rejected() {
        let spec = MonitorSpec {
            agent: "prometheus.io/builtin".into(),
            prometheus: None,
        };
        assert!(matches!(prometheus(&spec), Err(Error::ValidationError(_))));
    }

    #[tokio::test]
    async fn moving_namespaces_recreates_the_monitor() {
        let (client, server) = ApiServer::start();
        let agent = PrometheusOperatorAgent::new(client);
        let db = xdb();

        agent.add_monitor(&db, &monitor(None)).await.unwrap();
        assert!(server.exists("monitoring.coreos.com/v1", "servicemonitors", Some("demo"), "kubedb-demo-db1"));

        agent
            .update_monitor(&db, Some(&monitor(None)), Some(&monitor(Some("monitoring"))))
            .await
            .unwrap();
        assert!(!server.exists("monitoring.coreos.com/v1", "servicemonitors", Some("demo"), "kubedb-demo-db1"));
        assert!(server.exists("monitoring.coreos.com/v1", "servicemonitors", Some("monitoring"), "kubedb-demo-db1"));

        agent.delete_monitor(&db, &monitor(Some("monitoring"))).await.unwrap();
        agent.delete_monitor(&db, &monitor(Some("monitoring"))).await.unwrap();
        assert!(!server.exists("monitoring.coreos.com/v1", "servicemonitors", Some("monitoring"), "kubedb-demo-db1"));
    }
}
