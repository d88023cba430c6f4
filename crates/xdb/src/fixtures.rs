//! Helper methods only available for tests
//!
//! `ApiServer` answers the kube client from an in-memory object store, enough to run the
//! reconcilers end to end: get, list with label selectors, create, merge patch (with
//! resourceVersion preconditions and the status subresource), delete and deletecollection.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use crate::api::v1alpha1::{BackupScheduleSpec, MonitorSpec, Xdb};
use crate::config::Config;
use crate::controllers::{
    context::{Context, Integrations, State},
    monitor::MonitorAgent,
    scheduler::{parse_schedule, BackupScheduler},
};
use crate::registry::ImageRegistry;
use crate::storage::OsmDialer;
use crate::util::errors::Result;
use async_trait::async_trait;
use chrono::Utc;
use http::{Method, Request, Response, StatusCode};
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use kube::{client::Body, api::ObjectMeta, Client, Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

/// Resources whose status is only writable through the status subresource.
const STATUS_SUBRESOURCE: &[&str] = &["xdbs", "dormantdatabases", "snapshots"];

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Key {
    pub api_version: String,
    pub plural: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl Key {
    fn of<K: Resource<DynamicType = ()>>(namespace: Option<&str>, name: &str) -> Self {
        Self {
            api_version: K::api_version(&()).to_string(),
            plural: K::plural(&()).to_string(),
            namespace: namespace.map(String::from),
            name: name.to_string(),
        }
    }
}

#[derive(Default)]
struct Store {
    objects: BTreeMap<Key, Value>,
    requests: Vec<(String, String)>,
    status_patches: Vec<(Key, Value)>,
    conflicts: usize,
    version: u64,
}

/// Target of one request, parsed from its path.
struct Target {
    api_version: String,
    plural: String,
    namespace: Option<String>,
    name: Option<String>,
    subresource: Option<String>,
}

fn parse_path(path: &str) -> Option<Target> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let (api_version, mut rest) = match segments.first()? {
        &"api" => (segments.get(1)?.to_string(), &segments[2..]),
        &"apis" => (format!("{}/{}", segments.get(1)?, segments.get(2)?), &segments[3..]),
        _ => return None,
    };
    let mut namespace = None;
    if rest.first() == Some(&"namespaces") && rest.len() >= 3 {
        namespace = Some(rest[1].to_string());
        rest = &rest[2..];
    }
    Some(Target {
        api_version,
        plural: rest.first()?.to_string(),
        namespace,
        name: rest.get(1).map(|s| s.to_string()),
        subresource: rest.get(2).map(|s| s.to_string()),
    })
}

fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    form_urlencoded::parse(query.unwrap_or_default().as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

/// Matches equality, inequality and existence requirements of a label selector.
fn matches_selector(object: &Value, selector: Option<&str>) -> bool {
    let Some(selector) = selector.filter(|s| !s.is_empty()) else {
        return true;
    };
    let labels = &object["metadata"]["labels"];
    selector.split(',').all(|requirement| {
        if let Some((key, value)) = requirement.split_once("!=") {
            labels[key.trim()].as_str() != Some(value.trim())
        } else if let Some((key, value)) = requirement.split_once('=') {
            let value = value.trim_start_matches('=');
            labels[key.trim()].as_str() == Some(value.trim())
        } else {
            !labels[requirement.trim()].is_null()
        }
    })
}

fn status_body(code: StatusCode, reason: &str, message: String) -> (StatusCode, Value) {
    (
        code,
        json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": message,
            "reason": reason,
            "code": code.as_u16(),
        }),
    )
}

fn not_found(target: &Target) -> (StatusCode, Value) {
    status_body(
        StatusCode::NOT_FOUND,
        "NotFound",
        format!(
            "{} \"{}\" not found",
            target.plural,
            target.name.clone().unwrap_or_default()
        ),
    )
}

impl Store {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn stamp(&mut self, object: &mut Value) {
        let version = self.next_version();
        let metadata = &mut object["metadata"];
        metadata["resourceVersion"] = json!(version);
        if metadata["uid"].is_null() {
            metadata["uid"] = json!(uuid::Uuid::new_v4().to_string());
        }
        if metadata["creationTimestamp"].is_null() {
            metadata["creationTimestamp"] = json!(Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true));
        }
    }

    fn key(target: &Target, name: &str) -> Key {
        Key {
            api_version: target.api_version.clone(),
            plural: target.plural.clone(),
            namespace: target.namespace.clone(),
            name: name.to_string(),
        }
    }

    fn selected(&self, target: &Target, selector: Option<&str>) -> Vec<Key> {
        self.objects
            .iter()
            .filter(|(k, _)| k.api_version == target.api_version && k.plural == target.plural)
            .filter(|(k, _)| target.namespace.is_none() || k.namespace == target.namespace)
            .filter(|(_, v)| matches_selector(v, selector))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn list_body(&self, target: &Target, keys: &[Key]) -> Value {
        json!({
            "apiVersion": target.api_version,
            "kind": "List",
            "metadata": { "resourceVersion": self.version.to_string() },
            "items": keys.iter().filter_map(|k| self.objects.get(k)).collect::<Vec<_>>(),
        })
    }

    fn handle(&mut self, method: &Method, target: Target, query: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let selector = query_param(query, "labelSelector");
        match (method, target.name.clone()) {
            (&Method::GET, Some(name)) => match self.objects.get(&Self::key(&target, &name)) {
                Some(object) => (StatusCode::OK, object.clone()),
                None => not_found(&target),
            },
            (&Method::GET, None) => {
                let keys = self.selected(&target, selector.as_deref());
                (StatusCode::OK, self.list_body(&target, &keys))
            }
            (&Method::POST, _) => self.create(&target, body.unwrap_or(Value::Null)),
            (&Method::PATCH, Some(name)) => self.patch(&target, &name, body.unwrap_or(Value::Null)),
            (&Method::PUT, Some(name)) => self.replace(&target, &name, body.unwrap_or(Value::Null)),
            (&Method::DELETE, Some(name)) => match self.objects.remove(&Self::key(&target, &name)) {
                Some(object) => (StatusCode::OK, object),
                None => not_found(&target),
            },
            (&Method::DELETE, None) => {
                let keys = self.selected(&target, selector.as_deref());
                let body = self.list_body(&target, &keys);
                for key in keys {
                    self.objects.remove(&key);
                }
                (StatusCode::OK, body)
            }
            _ => status_body(
                StatusCode::METHOD_NOT_ALLOWED,
                "MethodNotAllowed",
                format!("{method} is not supported"),
            ),
        }
    }

    fn create(&mut self, target: &Target, mut object: Value) -> (StatusCode, Value) {
        if object["metadata"]["name"].is_null() {
            if let Some(prefix) = object["metadata"]["generateName"].as_str() {
                let suffix = &uuid::Uuid::new_v4().simple().to_string()[..5];
                object["metadata"]["name"] = json!(format!("{prefix}{suffix}"));
            }
        }
        let Some(name) = object["metadata"]["name"].as_str().map(String::from) else {
            return status_body(StatusCode::UNPROCESSABLE_ENTITY, "Invalid", "name is required".into());
        };
        let key = Self::key(target, &name);
        if self.objects.contains_key(&key) {
            return status_body(
                StatusCode::CONFLICT,
                "AlreadyExists",
                format!("{} \"{}\" already exists", target.plural, name),
            );
        }
        if let Some(namespace) = &target.namespace {
            object["metadata"]["namespace"] = json!(namespace);
        }
        if STATUS_SUBRESOURCE.contains(&target.plural.as_str()) {
            if let Some(map) = object.as_object_mut() {
                map.remove("status");
            }
        }
        self.stamp(&mut object);
        self.objects.insert(key, object.clone());
        (StatusCode::CREATED, object)
    }

    fn conflict(&mut self, target: &Target, name: &str) -> (StatusCode, Value) {
        self.conflicts += 1;
        status_body(
            StatusCode::CONFLICT,
            "Conflict",
            format!(
                "Operation cannot be fulfilled on {} \"{}\": the object has been modified",
                target.plural, name
            ),
        )
    }

    fn patch(&mut self, target: &Target, name: &str, mut patch: Value) -> (StatusCode, Value) {
        let key = Self::key(target, name);
        let Some(current) = self.objects.get(&key).cloned() else {
            return not_found(target);
        };
        if let Some(expected) = patch["metadata"]["resourceVersion"].as_str() {
            if current["metadata"]["resourceVersion"].as_str() != Some(expected) {
                return self.conflict(target, name);
            }
        }

        let status_patch = target.subresource.as_deref() == Some("status");
        if let Some(map) = patch.as_object_mut() {
            if status_patch {
                map.retain(|k, _| k == "status");
            } else if STATUS_SUBRESOURCE.contains(&target.plural.as_str()) {
                map.remove("status");
            }
        }

        if status_patch {
            self.status_patches.push((key.clone(), patch["status"].clone()));
        }
        let mut updated = current;
        json_patch::merge(&mut updated, &patch);
        self.stamp(&mut updated);
        self.objects.insert(key, updated.clone());
        (StatusCode::OK, updated)
    }

    fn replace(&mut self, target: &Target, name: &str, mut object: Value) -> (StatusCode, Value) {
        let key = Self::key(target, name);
        let Some(current) = self.objects.get(&key).cloned() else {
            return not_found(target);
        };
        if let Some(expected) = object["metadata"]["resourceVersion"].as_str() {
            if current["metadata"]["resourceVersion"].as_str() != Some(expected) {
                return self.conflict(target, name);
            }
        }
        if STATUS_SUBRESOURCE.contains(&target.plural.as_str()) {
            object["status"] = current["status"].clone();
        }
        self.stamp(&mut object);
        self.objects.insert(key, object.clone());
        (StatusCode::OK, object)
    }
}

/// In-memory API server backing a mocked `kube::Client`.
#[derive(Clone)]
pub struct ApiServer {
    store: Arc<Mutex<Store>>,
}

impl ApiServer {
    /// Spawns the server and returns a client talking to it. Needs a tokio runtime.
    pub fn start() -> (Client, ApiServer) {
        let (mock_service, mut handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let server = ApiServer {
            store: Arc::new(Mutex::new(Store::default())),
        };
        let store = server.store.clone();
        tokio::spawn(async move {
            while let Some((request, send)) = handle.next_request().await {
                let method = request.method().clone();
                let uri = request.uri().clone();
                let bytes = request.into_body().collect_bytes().await.unwrap_or_default();
                let body = serde_json::from_slice::<Value>(&bytes).ok();

                let (code, value) = {
                    let mut store = store.lock().unwrap();
                    match parse_path(uri.path()) {
                        Some(target) => {
                            if target.plural != "events" {
                                store.requests.push((method.to_string(), uri.path().to_string()));
                            }
                            store.handle(&method, target, uri.query(), body)
                        }
                        None => status_body(StatusCode::NOT_FOUND, "NotFound", format!("unknown path {uri}")),
                    }
                };
                let response = Response::builder()
                    .status(code)
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&value).unwrap()))
                    .unwrap();
                send.send_response(response);
            }
        });
        (Client::new(mock_service, "default"), server)
    }

    /// Stores `obj` as is, status included.
    pub fn insert<K>(&self, obj: &K)
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let mut value = serde_json::to_value(obj).unwrap();
        value["apiVersion"] = json!(K::api_version(&()));
        value["kind"] = json!(K::kind(&()));
        let key = Key::of::<K>(obj.meta().namespace.as_deref(), &obj.meta().name.clone().unwrap());
        let mut store = self.store.lock().unwrap();
        store.stamp(&mut value);
        store.objects.insert(key, value);
    }

    fn value(&self, key: &Key) -> Option<Value> {
        self.store.lock().unwrap().objects.get(key).cloned()
    }

    pub fn get<K>(&self, namespace: &str, name: &str) -> Option<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        self.value(&Key::of::<K>(Some(namespace), name))
            .map(|v| serde_json::from_value(v).unwrap())
    }

    pub fn get_cluster<K>(&self, name: &str) -> Option<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        self.value(&Key::of::<K>(None, name))
            .map(|v| serde_json::from_value(v).unwrap())
    }

    pub fn exists(&self, api_version: &str, plural: &str, namespace: Option<&str>, name: &str) -> bool {
        self.value(&Key {
            api_version: api_version.into(),
            plural: plural.into(),
            namespace: namespace.map(String::from),
            name: name.into(),
        })
        .is_some()
    }

    pub fn list<K>(&self, namespace: &str) -> Vec<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let store = self.store.lock().unwrap();
        store
            .objects
            .iter()
            .filter(|(k, _)| {
                k.api_version == K::api_version(&()) && k.plural == K::plural(&()) && k.namespace.as_deref() == Some(namespace)
            })
            .map(|(_, v)| serde_json::from_value(v.clone()).unwrap())
            .collect()
    }

    /// Merges `status` into the stored object, bypassing the status subresource.
    pub fn set_status<K>(&self, namespace: &str, name: &str, status: Value)
    where
        K: Resource<DynamicType = ()>,
    {
        let mut store = self.store.lock().unwrap();
        let key = Key::of::<K>(Some(namespace), name);
        let mut object = store.objects.get(&key).cloned().expect("object to exist");
        json_patch::merge(&mut object, &json!({ "status": status }));
        store.stamp(&mut object);
        store.objects.insert(key, object);
    }

    pub fn remove<K>(&self, namespace: &str, name: &str)
    where
        K: Resource<DynamicType = ()>,
    {
        self.store.lock().unwrap().objects.remove(&Key::of::<K>(Some(namespace), name));
    }

    /// `(method, path)` of every request except event publishing.
    pub fn requests(&self) -> Vec<(String, String)> {
        self.store.lock().unwrap().requests.clone()
    }

    pub fn count_requests(&self, method: &str) -> usize {
        self.requests().iter().filter(|(m, _)| m == method).count()
    }

    /// Bodies of the accepted status subresource patches of one object, oldest first.
    pub fn status_patches<K>(&self, namespace: &str, name: &str) -> Vec<Value>
    where
        K: Resource<DynamicType = ()>,
    {
        let key = Key::of::<K>(Some(namespace), name);
        self.store
            .lock()
            .unwrap()
            .status_patches
            .iter()
            .filter(|(k, _)| k == &key)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Phases written through the status subresource of one object, in order.
    pub fn phase_history<K>(&self, namespace: &str, name: &str) -> Vec<String>
    where
        K: Resource<DynamicType = ()>,
    {
        self.status_patches::<K>(namespace, name)
            .iter()
            .filter_map(|status| status["phase"].as_str().map(String::from))
            .collect()
    }

    pub fn count_conflicts(&self) -> usize {
        self.store.lock().unwrap().conflicts
    }

    /// Reasons of all recorded events, in no particular order.
    pub fn event_reasons(&self) -> Vec<String> {
        self.store
            .lock()
            .unwrap()
            .objects
            .iter()
            .filter(|(k, _)| k.plural == "events")
            .filter_map(|(_, v)| v["reason"].as_str().map(String::from))
            .collect()
    }

    pub fn has_event(&self, reason: &str) -> bool {
        self.event_reasons().iter().any(|r| r == reason)
    }

    /// Seeds the first pod of a workload in the Running phase.
    pub fn running_pod(&self, namespace: &str, name: &str, labels: BTreeMap<String, String>) {
        self.insert(&Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(namespace.into()),
                labels: Some(labels),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some("Running".into()),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
}

/// Backup scheduler that only remembers what it was asked to do.
#[derive(Default)]
pub struct RecordingScheduler {
    pub schedules: Mutex<HashMap<String, String>>,
}

impl RecordingScheduler {
    pub fn scheduled(&self, namespace: &str, name: &str) -> Option<String> {
        self.schedules.lock().unwrap().get(&format!("{namespace}/{name}")).cloned()
    }
}

impl BackupScheduler for RecordingScheduler {
    fn schedule_backup(&self, xdb: &Xdb, schedule: &BackupScheduleSpec) -> Result<()> {
        parse_schedule(&schedule.cron_expression)?;
        self.schedules.lock().unwrap().insert(
            format!("{}/{}", xdb.namespace().unwrap_or_default(), xdb.name_any()),
            schedule.cron_expression.clone(),
        );
        Ok(())
    }

    fn stop_scheduling(&self, namespace: &str, name: &str) {
        self.schedules.lock().unwrap().remove(&format!("{namespace}/{name}"));
    }

    fn stop_all(&self) {
        self.schedules.lock().unwrap().clear();
    }
}

/// Monitor agent recording `add`/`delete` calls as `"<op> <namespace>/<name>"`.
#[derive(Default)]
pub struct RecordingMonitor {
    pub calls: Mutex<Vec<String>>,
}

impl RecordingMonitor {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, op: &str, xdb: &Xdb) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{op} {}/{}", xdb.namespace().unwrap_or_default(), xdb.name_any()));
    }
}

#[async_trait]
impl MonitorAgent for RecordingMonitor {
    async fn add_monitor(&self, xdb: &Xdb, _spec: &MonitorSpec) -> Result<()> {
        self.record("add", xdb);
        Ok(())
    }

    async fn delete_monitor(&self, xdb: &Xdb, _spec: &MonitorSpec) -> Result<()> {
        self.record("delete", xdb);
        Ok(())
    }

    async fn update_monitor(&self, xdb: &Xdb, old: Option<&MonitorSpec>, new: Option<&MonitorSpec>) -> Result<()> {
        match (old, new) {
            (Some(_), None) => self.record("delete", xdb),
            (_, Some(_)) => self.record("add", xdb),
            (None, None) => {}
        }
        Ok(())
    }
}

/// Registry with a fixed answer for every tag.
pub struct StaticRegistry(pub bool);

#[async_trait]
impl ImageRegistry for StaticRegistry {
    async fn image_exists(&self, _repository: &str, _tag: &str) -> Result<bool> {
        Ok(self.0)
    }
}

pub fn test_config() -> Config {
    use envconfig::Envconfig;
    let env = HashMap::from(
        [
            ("POLL_INTERVAL_MS", "10"),
            ("READINESS_TIMEOUT_SECS", "1"),
            ("JOB_TIMEOUT_SECS", "1"),
            ("PAUSE_TIMEOUT_SECS", "1"),
            ("PATCH_RETRY_INITIAL_MS", "1"),
            ("PATCH_RETRY_MAX_MS", "20"),
            ("PATCH_RETRY_TIMEOUT_MS", "2000"),
        ]
        .map(|(k, v)| (k.to_string(), v.to_string())),
    );
    Config::init_from_hashmap(&env).unwrap()
}

/// A reconciler context wired to an `ApiServer` and recording integrations.
pub struct Harness {
    pub client: Client,
    pub server: ApiServer,
    pub ctx: Arc<Context>,
    pub scheduler: Arc<RecordingScheduler>,
    pub monitor: Arc<RecordingMonitor>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        let (client, server) = ApiServer::start();
        let scheduler = Arc::new(RecordingScheduler::default());
        let monitor = Arc::new(RecordingMonitor::default());
        let integrations = Integrations {
            scheduler: scheduler.clone(),
            monitor: monitor.clone(),
            storage: Arc::new(OsmDialer),
            registry: Arc::new(StaticRegistry(true)),
        };
        let ctx = State::default()
            .to_context(client.clone(), config, integrations)
            .unwrap();
        Self {
            client,
            server,
            ctx,
            scheduler,
            monitor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};

    #[test]
    fn paths_are_parsed() {
        let t = parse_path("/apis/kubedb.com/v1alpha1/namespaces/demo/xdbs/db1/status").unwrap();
        assert_eq!(t.api_version, "kubedb.com/v1alpha1");
        assert_eq!(t.namespace.as_deref(), Some("demo"));
        assert_eq!(t.plural, "xdbs");
        assert_eq!(t.name.as_deref(), Some("db1"));
        assert_eq!(t.subresource.as_deref(), Some("status"));

        let t = parse_path("/api/v1/namespaces/demo").unwrap();
        assert_eq!(t.plural, "namespaces");
        assert_eq!(t.name.as_deref(), Some("demo"));
        assert!(t.namespace.is_none());
    }

    #[test]
    fn selectors_match_labels() {
        let obj = json!({"metadata": {"labels": {"a": "1", "b": "2"}}});
        assert!(matches_selector(&obj, Some("a=1,b")));
        assert!(matches_selector(&obj, Some("a==1,c!=3")));
        assert!(!matches_selector(&obj, Some("a=2")));
        assert!(!matches_selector(&obj, Some("c")));
    }

    #[tokio::test]
    async fn stale_resource_versions_conflict() {
        let (client, server) = ApiServer::start();
        let api: Api<ConfigMap> = Api::namespaced(client, "default");
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some("cm".into());
        let created = api.create(&PostParams::default(), &cm).await.unwrap();
        assert!(api.create(&PostParams::default(), &cm).await.is_err());

        let stale = json!({"metadata": {"resourceVersion": "0"}, "data": {"a": "b"}});
        let err = api
            .patch("cm", &PatchParams::default(), &Patch::Merge(&stale))
            .await
            .unwrap_err();
        assert!(crate::util::errors::is_conflict(&err));

        let fresh = json!({"metadata": {"resourceVersion": created.resource_version()}, "data": {"a": "b"}});
        api.patch("cm", &PatchParams::default(), &Patch::Merge(&fresh)).await.unwrap();
        assert_eq!(api.list(&ListParams::default()).await.unwrap().items.len(), 1);
        assert_eq!(server.count_conflicts(), 1);
    }
}
