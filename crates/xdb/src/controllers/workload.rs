//! Service, StatefulSet, admin secret and access control of an `Xdb`.

use crate::api::{
    v1alpha1::Xdb, ANNOTATION_XDB_VERSION, LABEL_DATABASE_KIND, PROMETHEUS_EXPORTER_PORT_NAME,
    PROMETHEUS_EXPORTER_PORT_NUMBER,
};
use crate::config::Config;
use crate::controllers::{context::Context, rbac};
use crate::util::{
    errors::{Error, Result},
    patch::try_patch,
    wait::{poll_until, PollConfig},
};
use k8s_openapi::{
    api::{
        apps::v1::{StatefulSet, StatefulSetSpec},
        core::v1::{
            Container, ContainerPort, EmptyDirVolumeSource, PersistentVolumeClaim, Pod, PodSpec,
            PodTemplateSpec, Secret, SecretVolumeSource, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::{apis::meta::v1::LabelSelector, util::intstr::IntOrString},
    ByteString,
};
use kube::{
    api::{Api, ObjectMeta, PostParams},
    Client, ResourceExt,
};
use rand::RngCore;
use std::collections::BTreeMap;
use tracing::{debug, info};

pub const CONTAINER_NAME: &str = "xdb";
pub const EXPORTER_CONTAINER_NAME: &str = "exporter";
pub const DATABASE_PORT_NAME: &str = "db";
pub const DATA_VOLUME: &str = "data";
pub const DATA_MOUNT_PATH: &str = "/var/pv";
pub const SECRET_VOLUME: &str = "secret";
pub const SECRET_MOUNT_PATH: &str = "/srv/xdb/secrets";
pub const INIT_SCRIPT_VOLUME: &str = "initial-script";
pub const INIT_SCRIPT_MOUNT_PATH: &str = "/var/db-script";
pub const ADMIN_PASSWORD_KEY: &str = "password";

/// Outcome of [`ensure_statefulset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    /// The workload was created and its first pod is running.
    Created,
    Existing,
}

fn namespace_of(xdb: &Xdb) -> Result<String> {
    xdb.namespace()
        .ok_or_else(|| Error::MetadataMissing("Xdb has no namespace".into()))
}

/// Headless service shared by every database of a namespace.
pub fn governing_service(name: &str, namespace: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            cluster_ip: Some("None".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub async fn ensure_governing_service(client: &Client, namespace: &str, name: &str) -> Result<()> {
    let api: Api<Service> = Api::namespaced(client.clone(), namespace);
    if api.get_opt(name).await?.is_none() {
        match api.create(&PostParams::default(), &governing_service(name, namespace)).await {
            Ok(_) => info!("created governing service {}/{}", namespace, name),
            // another database of the namespace got there first
            Err(e) if crate::util::errors::is_conflict(&e) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn service_ports(config: &Config, xdb: &Xdb) -> Vec<ServicePort> {
    let mut ports = vec![ServicePort {
        name: Some(DATABASE_PORT_NAME.to_string()),
        port: config.database_port,
        protocol: Some("TCP".to_string()),
        target_port: Some(IntOrString::String(DATABASE_PORT_NAME.to_string())),
        ..Default::default()
    }];
    if xdb.spec.exports_metrics() {
        ports.push(ServicePort {
            name: Some(PROMETHEUS_EXPORTER_PORT_NAME.to_string()),
            port: PROMETHEUS_EXPORTER_PORT_NUMBER,
            protocol: Some("TCP".to_string()),
            target_port: Some(IntOrString::String(PROMETHEUS_EXPORTER_PORT_NAME.to_string())),
            ..Default::default()
        });
    }
    ports
}

pub fn service(config: &Config, xdb: &Xdb) -> Result<Service> {
    Ok(Service {
        metadata: ObjectMeta {
            name: Some(xdb.offshoot_name()),
            namespace: Some(namespace_of(xdb)?),
            labels: Some(xdb.offshoot_labels()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(xdb.offshoot_labels()),
            ports: Some(service_ports(config, xdb)),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn port_names(ports: &[ServicePort]) -> Vec<Option<String>> {
    ports.iter().map(|p| p.name.clone()).collect()
}

/// Creates the database service, or checks that the existing one is ours and exposes the right ports.
pub async fn ensure_service(ctx: &Context, xdb: &Xdb) -> Result<()> {
    let namespace = namespace_of(xdb)?;
    let name = xdb.offshoot_name();
    let api: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);

    let Some(existing) = api.get_opt(&name).await? else {
        api.create(&PostParams::default(), &service(&ctx.config, xdb)?).await?;
        info!("created service {}/{}", namespace, name);
        return Ok(());
    };

    let spec = existing.spec.unwrap_or_default();
    if spec.selector.unwrap_or_default() != xdb.offshoot_labels() {
        return Err(Error::ProvisioningError(format!(
            "service {namespace}/{name} exists with a selector for another workload"
        )));
    }
    let desired = service_ports(&ctx.config, xdb);
    if port_names(&spec.ports.unwrap_or_default()) != port_names(&desired) {
        try_patch(&api, &name, &ctx.retry(), |svc: &mut Service| {
            if let Some(spec) = svc.spec.as_mut() {
                spec.ports = Some(desired.clone());
            }
        })
        .await?;
        debug!("updated ports of service {}/{}", namespace, name);
    }
    Ok(())
}

fn database_container(config: &Config, xdb: &Xdb) -> Container {
    let mut container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(config.xdb_image(&xdb.spec.version)),
        image_pull_policy: Some("IfNotPresent".to_string()),
        ports: Some(vec![ContainerPort {
            name: Some(DATABASE_PORT_NAME.to_string()),
            container_port: config.database_port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        resources: xdb.spec.resources.clone(),
        volume_mounts: Some(vec![
            VolumeMount {
                name: DATA_VOLUME.to_string(),
                mount_path: DATA_MOUNT_PATH.to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: SECRET_VOLUME.to_string(),
                mount_path: SECRET_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    if let Some(script) = xdb.spec.init.as_ref().and_then(|i| i.script_source.as_ref()) {
        if let Some(mounts) = container.volume_mounts.as_mut() {
            mounts.push(VolumeMount {
                name: INIT_SCRIPT_VOLUME.to_string(),
                mount_path: INIT_SCRIPT_MOUNT_PATH.to_string(),
                ..Default::default()
            });
        }
        container.args = Some(vec![format!(
            "{}/{}",
            INIT_SCRIPT_MOUNT_PATH,
            script.script_path.trim_start_matches('/')
        )]);
    }
    container
}

fn exporter_container(config: &Config, xdb: &Xdb) -> Container {
    Container {
        name: EXPORTER_CONTAINER_NAME.to_string(),
        image: Some(config.exporter_image()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        args: Some(vec![
            "export".to_string(),
            format!("--address=:{PROMETHEUS_EXPORTER_PORT_NUMBER}"),
            format!("--metrics-path={}", xdb.metrics_path()),
        ]),
        ports: Some(vec![ContainerPort {
            name: Some(PROMETHEUS_EXPORTER_PORT_NAME.to_string()),
            container_port: PROMETHEUS_EXPORTER_PORT_NUMBER,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// The desired StatefulSet of `xdb`. The admin secret reference must already be set.
pub fn statefulset(config: &Config, xdb: &Xdb) -> Result<StatefulSet> {
    let namespace = namespace_of(xdb)?;
    let mut containers = vec![database_container(config, xdb)];
    if xdb.spec.exports_metrics() {
        containers.push(exporter_container(config, xdb));
    }

    let mut volumes = vec![Volume {
        name: SECRET_VOLUME.to_string(),
        secret: Some(xdb.spec.database_secret.clone().unwrap_or_else(|| SecretVolumeSource {
            secret_name: Some(xdb.admin_secret_name()),
            ..Default::default()
        })),
        ..Default::default()
    }];
    if let Some(script) = xdb.spec.init.as_ref().and_then(|i| i.script_source.as_ref()) {
        volumes.push(script.volume_source.to_volume(INIT_SCRIPT_VOLUME));
    }

    let volume_claim_templates = match &xdb.spec.storage {
        Some(storage) => {
            let mut spec = storage.clone();
            if spec.access_modes.as_ref().map_or(true, |m| m.is_empty()) {
                spec.access_modes = Some(vec!["ReadWriteOnce".to_string()]);
            }
            Some(vec![PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some(DATA_VOLUME.to_string()),
                    ..Default::default()
                },
                spec: Some(spec),
                ..Default::default()
            }])
        }
        None => {
            volumes.push(Volume {
                name: DATA_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            });
            None
        }
    };

    let labels = xdb.statefulset_labels();
    let annotations = xdb.statefulset_annotations();
    Ok(StatefulSet {
        metadata: ObjectMeta {
            name: Some(xdb.offshoot_name()),
            namespace: Some(namespace),
            labels: Some(labels.clone()),
            annotations: Some(annotations.clone()),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(xdb.spec.replicas()),
            service_name: Some(config.governing_service.clone()),
            selector: LabelSelector {
                match_labels: Some(xdb.offshoot_labels()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers,
                    volumes: Some(volumes),
                    node_selector: xdb.spec.node_selector.clone(),
                    affinity: xdb.spec.affinity.clone(),
                    scheduler_name: xdb.spec.scheduler_name.clone(),
                    tolerations: xdb.spec.tolerations.clone(),
                    service_account_name: config.enable_rbac.then(|| xdb.offshoot_name()),
                    ..Default::default()
                }),
            },
            volume_claim_templates,
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Generates the admin secret when `xdb` does not reference one and records the reference in
/// the spec. Returns the up to date object.
pub async fn ensure_admin_secret(ctx: &Context, xdb: &Xdb) -> Result<Xdb> {
    if xdb.spec.database_secret_name().is_some() {
        return Ok(xdb.clone());
    }
    let namespace = namespace_of(xdb)?;
    let name = xdb.admin_secret_name();
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);

    if secrets.get_opt(&name).await?.is_none() {
        let mut bytes = [0; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.clone()),
                labels: Some(BTreeMap::from([(
                    LABEL_DATABASE_KIND.to_string(),
                    <Xdb as kube::Resource>::kind(&()).to_string(),
                )])),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            data: Some(BTreeMap::from([(
                ADMIN_PASSWORD_KEY.to_string(),
                ByteString(hex::encode(bytes).into_bytes()),
            )])),
            ..Default::default()
        };
        secrets.create(&PostParams::default(), &secret).await?;
        info!("created admin secret {}/{}", namespace, name);
    }

    let xdbs: Api<Xdb> = Api::namespaced(ctx.client.clone(), &namespace);
    try_patch(&xdbs, &xdb.name_any(), &ctx.retry(), |db: &mut Xdb| {
        db.spec.database_secret = Some(SecretVolumeSource {
            secret_name: Some(name.clone()),
            ..Default::default()
        });
    })
    .await
}

/// Creates the StatefulSet of `xdb` and waits for its first pod, or brings an existing one back
/// in line with the spec.
///
/// Returns the `Xdb` as last written, which carries the admin secret reference after a create.
pub async fn ensure_statefulset(ctx: &Context, xdb: &Xdb) -> Result<(Xdb, Provisioned)> {
    let namespace = namespace_of(xdb)?;
    let name = xdb.offshoot_name();
    let api: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), &namespace);

    if let Some(existing) = api.get_opt(&name).await? {
        let kind = existing.labels().get(LABEL_DATABASE_KIND).cloned().unwrap_or_default();
        if kind != <Xdb as kube::Resource>::kind(&()) {
            return Err(Error::ProvisioningError(format!(
                "statefulset {namespace}/{name} is not managed as an Xdb"
            )));
        }
        let (replicas, image, version) = (
            xdb.spec.replicas(),
            ctx.config.xdb_image(&xdb.spec.version),
            xdb.spec.version.clone(),
        );
        try_patch(&api, &name, &ctx.retry(), |sts: &mut StatefulSet| {
            sts.annotations_mut()
                .insert(ANNOTATION_XDB_VERSION.to_string(), version.clone());
            if let Some(spec) = sts.spec.as_mut() {
                spec.replicas = Some(replicas);
                if let Some(container) = spec
                    .template
                    .spec
                    .as_mut()
                    .and_then(|p| p.containers.iter_mut().find(|c| c.name == CONTAINER_NAME))
                {
                    container.image = Some(image.clone());
                }
            }
        })
        .await?;
        return Ok((xdb.clone(), Provisioned::Existing));
    }

    let xdb = ensure_admin_secret(ctx, xdb).await?;
    if ctx.config.enable_rbac {
        rbac::ensure_rbac(&ctx.client, &xdb).await?;
    }
    api.create(&PostParams::default(), &statefulset(&ctx.config, &xdb)?)
        .await?;
    info!("created statefulset {}/{}", namespace, name);

    wait_for_running(&ctx.client, &namespace, &format!("{name}-0"), ctx.config.readiness_poll()).await?;
    Ok((xdb, Provisioned::Created))
}

/// Polls until pod `name` reports the Running phase.
pub async fn wait_for_running(client: &Client, namespace: &str, name: &str, poll: PollConfig) -> Result<()> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let (pods, pod) = (&pods, name);
    poll_until(&format!("pod {namespace}/{name} running"), poll, move || async move {
        let running = pods
            .get_opt(pod)
            .await?
            .and_then(|p| p.status)
            .and_then(|s| s.phase)
            .is_some_and(|phase| phase == "Running");
        Ok(running.then_some(()))
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1alpha1::{InitSpec, MonitorSpec, PrometheusSpec, ScriptSourceSpec, VolumeSource, XdbSpec};
    use crate::api::AGENT_COREOS_PROMETHEUS;
    use crate::fixtures::{test_config, Harness};
    use k8s_openapi::api::core::v1::PersistentVolumeClaimSpec;

    fn xdb(spec: XdbSpec) -> Xdb {
        let mut xdb = Xdb::new("db1", spec);
        xdb.metadata.namespace = Some("default".into());
        xdb.metadata.labels = Some(BTreeMap::from([
            ("team".to_string(), "a".to_string()),
            ("kubedb.com/owner".to_string(), "x".to_string()),
        ]));
        xdb
    }

    fn base() -> XdbSpec {
        XdbSpec {
            version: "1.0".into(),
            ..Default::default()
        }
    }

    #[test]
    fn statefulset_without_storage_uses_an_empty_dir() {
        let sts = statefulset(&test_config(), &xdb(base())).unwrap();
        let spec = sts.spec.unwrap();
        assert!(spec.volume_claim_templates.is_none());
        assert_eq!(spec.service_name.as_deref(), Some("kubedb"));
        assert_eq!(spec.replicas, Some(1));
        let pod = spec.template.spec.unwrap();
        let data = pod.volumes.unwrap().into_iter().find(|v| v.name == DATA_VOLUME).unwrap();
        assert!(data.empty_dir.is_some());
        assert_eq!(pod.containers.len(), 1);
        assert_eq!(pod.containers[0].image.as_deref(), Some("kubedb/xdb:1.0"));

        let labels = sts.metadata.labels.unwrap();
        assert_eq!(labels["team"], "a");
        assert!(!labels.contains_key("kubedb.com/owner"));
        assert_eq!(sts.metadata.annotations.unwrap()[ANNOTATION_XDB_VERSION], "1.0");
    }

    #[test]
    fn statefulset_with_storage_script_and_monitor() {
        let spec = XdbSpec {
            storage: Some(PersistentVolumeClaimSpec {
                storage_class_name: Some("standard".into()),
                ..Default::default()
            }),
            init: Some(InitSpec {
                script_source: Some(ScriptSourceSpec {
                    script_path: "init/run.sh".into(),
                    volume_source: VolumeSource {
                        secret: Some(SecretVolumeSource {
                            secret_name: Some("scripts".into()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                }),
                snapshot_source: None,
            }),
            monitor: Some(MonitorSpec {
                agent: AGENT_COREOS_PROMETHEUS.into(),
                prometheus: Some(PrometheusSpec::default()),
            }),
            ..base()
        };
        let sts = statefulset(&test_config(), &xdb(spec)).unwrap();
        let spec = sts.spec.unwrap();
        let claims = spec.volume_claim_templates.unwrap();
        assert_eq!(claims[0].metadata.name.as_deref(), Some(DATA_VOLUME));
        assert_eq!(
            claims[0].spec.as_ref().unwrap().access_modes.clone().unwrap(),
            ["ReadWriteOnce".to_string()]
        );

        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.containers.len(), 2);
        assert_eq!(pod.containers[0].args.clone().unwrap(), ["/var/db-script/init/run.sh"]);
        assert_eq!(pod.containers[1].image.as_deref(), Some("kubedb/operator:0.6.0"));
        let script = pod.volumes.unwrap().into_iter().find(|v| v.name == INIT_SCRIPT_VOLUME).unwrap();
        assert_eq!(script.secret.unwrap().secret_name.as_deref(), Some("scripts"));
    }

    #[test]
    fn service_exposes_metrics_port_only_when_monitored() {
        let config = test_config();
        let plain = service(&config, &xdb(base())).unwrap();
        assert_eq!(plain.spec.unwrap().ports.unwrap().len(), 1);

        let monitored = XdbSpec {
            monitor: Some(MonitorSpec {
                agent: AGENT_COREOS_PROMETHEUS.into(),
                prometheus: Some(PrometheusSpec::default()),
            }),
            ..base()
        };
        let ports = service(&config, &xdb(monitored)).unwrap().spec.unwrap().ports.unwrap();
        assert_eq!(ports[1].port, PROMETHEUS_EXPORTER_PORT_NUMBER);
    }

    #[tokio::test]
    async fn foreign_service_is_not_adopted() {
        let h = Harness::new();
        let mut foreign = service(&test_config(), &xdb(base())).unwrap();
        foreign.spec.as_mut().unwrap().selector = Some(BTreeMap::from([("app".to_string(), "other".to_string())]));
        h.server.insert(&foreign);

        let err = ensure_service(&h.ctx, &xdb(base())).await.unwrap_err();
        assert!(matches!(err, Error::ProvisioningError(_)));
    }

    #[tokio::test]
    async fn create_generates_admin_secret_and_waits_for_the_pod() {
        let h = Harness::new();
        let db = xdb(base());
        h.server.insert(&db);
        h.server.running_pod("default", "db1-0", db.offshoot_labels());

        let (updated, outcome) = ensure_statefulset(&h.ctx, &db).await.unwrap();
        assert_eq!(outcome, Provisioned::Created);
        assert_eq!(updated.spec.database_secret_name(), Some("db1-admin-auth"));
        let secret = h.server.get::<Secret>("default", "db1-admin-auth").unwrap();
        assert_eq!(secret.data.unwrap()[ADMIN_PASSWORD_KEY].0.len(), 32);

        let (_, again) = ensure_statefulset(&h.ctx, &updated).await.unwrap();
        assert_eq!(again, Provisioned::Existing);
        assert_eq!(h.server.list::<StatefulSet>("default").len(), 1);
    }

    #[tokio::test]
    async fn pod_that_never_runs_is_a_timeout() {
        let h = Harness::new();
        let db = xdb(base());
        h.server.insert(&db);

        let err = ensure_statefulset(&h.ctx, &db).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }
}
