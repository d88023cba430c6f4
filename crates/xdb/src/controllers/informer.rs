//! Add/update/delete notifications on top of a `kube` watcher.
//!
//! Lifecycle handling needs the previous object on update and a notification for objects that
//! disappeared while the watch was down, which `Controller` does not give us.

use futures::StreamExt;
use kube::{
    runtime::{
        reflector::ObjectRef,
        watcher::{self, watcher, Event},
        WatchStreamExt,
    },
    Api, Resource,
};
use serde::de::DeserializeOwned;
use std::{
    collections::{HashMap, HashSet},
    fmt::Debug,
    future::Future,
    sync::Arc,
};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub enum Notification<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    Deleted(Arc<K>),
}

/// Last known state of every watched object.
pub struct Informer<K: Resource<DynamicType = ()>> {
    known: HashMap<ObjectRef<K>, Arc<K>>,
    relisted: Option<HashSet<ObjectRef<K>>>,
}

impl<K: Resource<DynamicType = ()>> Default for Informer<K> {
    fn default() -> Self {
        Self {
            known: HashMap::new(),
            relisted: None,
        }
    }
}

impl<K> Informer<K>
where
    K: Resource<DynamicType = ()> + Clone,
{
    pub fn handle(&mut self, event: Event<K>) -> Vec<Notification<K>> {
        match event {
            Event::Init => {
                self.relisted = Some(HashSet::new());
                vec![]
            }
            Event::InitApply(obj) => {
                if let Some(seen) = self.relisted.as_mut() {
                    seen.insert(ObjectRef::from_obj(&obj));
                }
                self.apply(obj).into_iter().collect()
            }
            Event::InitDone => {
                let seen = self.relisted.take().unwrap_or_default();
                let gone: Vec<ObjectRef<K>> = self.known.keys().filter(|k| !seen.contains(*k)).cloned().collect();
                gone.into_iter()
                    .filter_map(|key| self.known.remove(&key))
                    .map(Notification::Deleted)
                    .collect()
            }
            Event::Apply(obj) => self.apply(obj).into_iter().collect(),
            Event::Delete(obj) => {
                self.known.remove(&ObjectRef::from_obj(&obj));
                vec![Notification::Deleted(Arc::new(obj))]
            }
        }
    }

    fn apply(&mut self, obj: K) -> Option<Notification<K>> {
        let new = Arc::new(obj);
        match self.known.insert(ObjectRef::from_obj(new.as_ref()), new.clone()) {
            None => Some(Notification::Added(new)),
            // resync of an unchanged object
            Some(old) if old.meta().resource_version == new.meta().resource_version => None,
            Some(old) => Some(Notification::Updated { old, new }),
        }
    }
}

/// Watch config limited to objects labelled `label=value`.
pub fn labelled(label: &str, value: &str) -> watcher::Config {
    watcher::Config::default().labels(&format!("{label}={value}"))
}

pub fn has_label<K: Resource>(obj: &K, label: &str, value: &str) -> bool {
    obj.meta()
        .labels
        .as_ref()
        .and_then(|labels| labels.get(label))
        .is_some_and(|v| v == value)
}

/// Watches `api` forever, feeding notifications to `handler` one at a time.
pub async fn watch<K, F, Fut>(api: Api<K>, config: watcher::Config, mut handler: F)
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + 'static,
    F: FnMut(Notification<K>) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut informer = Informer::default();
    let mut events = watcher(api, config).default_backoff().boxed();
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => {
                for notification in informer.handle(event) {
                    handler(notification).await;
                }
            }
            Err(e) => warn!("{} watch failed: {}", K::kind(&()), e),
        }
    }
    debug!("{} watch ended", K::kind(&()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    fn cm(name: &str, rv: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                resource_version: Some(rv.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn kinds(notifications: &[Notification<ConfigMap>]) -> Vec<&'static str> {
        notifications
            .iter()
            .map(|n| match n {
                Notification::Added(_) => "added",
                Notification::Updated { .. } => "updated",
                Notification::Deleted(_) => "deleted",
            })
            .collect()
    }

    #[test]
    fn unchanged_resyncs_are_suppressed() {
        let mut informer = Informer::default();
        assert_eq!(kinds(&informer.handle(Event::Apply(cm("a", "1")))), ["added"]);
        assert!(informer.handle(Event::Apply(cm("a", "1"))).is_empty());

        let updated = informer.handle(Event::Apply(cm("a", "2")));
        match &updated[..] {
            [Notification::Updated { old, new }] => {
                assert_eq!(old.metadata.resource_version.as_deref(), Some("1"));
                assert_eq!(new.metadata.resource_version.as_deref(), Some("2"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(kinds(&informer.handle(Event::Delete(cm("a", "2")))), ["deleted"]);
    }

    #[test]
    fn label_filters_select_one_kind() {
        let config = labelled("kubedb.com/kind", "Xdb");
        assert_eq!(config.label_selector.as_deref(), Some("kubedb.com/kind=Xdb"));

        let mut labelled_cm = cm("a", "1");
        labelled_cm.metadata.labels = Some([("kubedb.com/kind".to_string(), "Xdb".to_string())].into());
        assert!(has_label(&labelled_cm, "kubedb.com/kind", "Xdb"));
        assert!(!has_label(&labelled_cm, "kubedb.com/kind", "Postgres"));
        assert!(!has_label(&cm("b", "1"), "kubedb.com/kind", "Xdb"));
    }

    #[test]
    fn relist_reports_objects_deleted_while_away() {
        let mut informer = Informer::default();
        informer.handle(Event::Apply(cm("a", "1")));
        informer.handle(Event::Apply(cm("b", "1")));

        assert!(informer.handle(Event::Init).is_empty());
        assert!(informer.handle(Event::InitApply(cm("a", "1"))).is_empty());
        let done = informer.handle(Event::InitDone);
        match &done[..] {
            [Notification::Deleted(gone)] => assert_eq!(gone.metadata.name.as_deref(), Some("b")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
