use crate::api::{
    v1alpha1::{BackupScheduleSpec, Snapshot, SnapshotPhase, SnapshotSpec, Xdb},
    LABEL_DATABASE_KIND, LABEL_DATABASE_NAME, LABEL_SNAPSHOT_STATUS,
};
use crate::util::{
    errors::{is_not_found, Error, Result},
    label_selector,
};
use chrono::{DateTime, Utc};
use cron::Schedule;
use kube::{
    api::{Api, ListParams, ObjectMeta, PostParams},
    Client, Resource, ResourceExt,
};
use std::{
    collections::{BTreeMap, HashMap},
    str::FromStr,
    sync::Mutex,
};
use tokio::{task::JoinHandle, time::sleep};
use tracing::{info, warn};

/// Periodically asks for backups of a database.
pub trait BackupScheduler: Send + Sync {
    /// Registers (or replaces) the schedule of `xdb`.
    fn schedule_backup(&self, xdb: &Xdb, schedule: &BackupScheduleSpec) -> Result<()>;

    fn stop_scheduling(&self, namespace: &str, name: &str);

    fn stop_all(&self);
}

/// Parses a cron expression. Five field expressions get a leading seconds field.
pub fn parse_schedule(expression: &str) -> Result<Schedule> {
    let expression = expression.trim();
    let normalized = if !expression.starts_with('@') && expression.split_whitespace().count() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    };
    Schedule::from_str(&normalized)
        .map_err(|e| Error::ScheduleError(format!("invalid cron expression {expression:?}: {e}")))
}

/// Runs one tokio task per scheduled database, creating `Snapshot` objects on every tick.
pub struct CronScheduler {
    client: Client,
    entries: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl CronScheduler {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_scheduled(&self, namespace: &str, name: &str) -> bool {
        self.entries
            .lock()
            .map(|entries| entries.contains_key(&format!("{namespace}/{name}")))
            .unwrap_or(false)
    }
}

impl BackupScheduler for CronScheduler {
    fn schedule_backup(&self, xdb: &Xdb, schedule: &BackupScheduleSpec) -> Result<()> {
        let cron = parse_schedule(&schedule.cron_expression)?;
        let namespace = xdb
            .namespace()
            .ok_or_else(|| Error::MetadataMissing("Xdb has no namespace".into()))?;
        let name = xdb.name_any();
        let key = format!("{namespace}/{name}");

        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::ScheduleError("scheduler state poisoned".into()))?;
        let task = tokio::spawn(run_schedule(
            self.client.clone(),
            cron,
            namespace,
            name,
            schedule.clone(),
        ));
        if let Some(previous) = entries.insert(key.clone(), task) {
            previous.abort();
        }
        info!("scheduled backups of {} with {:?}", key, schedule.cron_expression);
        Ok(())
    }

    fn stop_scheduling(&self, namespace: &str, name: &str) {
        let key = format!("{namespace}/{name}");
        if let Ok(mut entries) = self.entries.lock() {
            if let Some(task) = entries.remove(&key) {
                task.abort();
                info!("stopped backups of {}", key);
            }
        }
    }

    fn stop_all(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            for (_, task) in entries.drain() {
                task.abort();
            }
        }
    }
}

async fn run_schedule(client: Client, schedule: Schedule, namespace: String, name: String, spec: BackupScheduleSpec) {
    while let Some(next) = schedule.upcoming(Utc).next() {
        let wait = (next - Utc::now()).to_std().unwrap_or_default();
        sleep(wait).await;
        match create_scheduled_snapshot(&client, &namespace, &name, &spec, next).await {
            Ok(Some(snapshot)) => info!("created scheduled snapshot {}/{}", namespace, snapshot.name_any()),
            Ok(None) => {}
            Err(e) => warn!("scheduled backup of {}/{} failed: {}", namespace, name, e),
        }
    }
}

/// Creates the snapshot for one tick, unless the database is gone or a backup is still running.
pub async fn create_scheduled_snapshot(
    client: &Client,
    namespace: &str,
    name: &str,
    spec: &BackupScheduleSpec,
    at: DateTime<Utc>,
) -> Result<Option<Snapshot>> {
    let xdbs: Api<Xdb> = Api::namespaced(client.clone(), namespace);
    let xdb = match xdbs.get(name).await {
        Ok(xdb) => xdb,
        Err(e) if is_not_found(&e) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if xdb.metadata.deletion_timestamp.is_some() {
        return Ok(None);
    }

    let mut labels = xdb.offshoot_labels();
    let snapshots: Api<Snapshot> = Api::namespaced(client.clone(), namespace);
    let mut running = labels.clone();
    running.insert(LABEL_SNAPSHOT_STATUS.into(), SnapshotPhase::Running.to_string());
    let in_flight = snapshots
        .list(&ListParams::default().labels(&label_selector(&running)))
        .await?;
    if !in_flight.items.is_empty() {
        info!("skipping backup of {}/{}, a snapshot is still running", namespace, name);
        return Ok(None);
    }

    labels.retain(|k, _| k == LABEL_DATABASE_KIND || k == LABEL_DATABASE_NAME);
    let snapshot = Snapshot {
        metadata: ObjectMeta {
            name: Some(format!("{}-{}", name, at.format("%Y%m%d-%H%M%S"))),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: SnapshotSpec {
            database_name: name.to_string(),
            storage: spec.storage.clone(),
            resources: spec.resources.clone(),
        },
        status: None,
    };
    let created = snapshots.create(&PostParams::default(), &snapshot).await?;
    Ok(Some(created))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1alpha1::{storage::LocalSpec, SnapshotStorageSpec, XdbSpec};
    use crate::fixtures::ApiServer;
    use chrono::TimeZone;
    use tokio::time::Duration;

    fn schedule(expression: &str) -> BackupScheduleSpec {
        BackupScheduleSpec {
            cron_expression: expression.into(),
            storage: SnapshotStorageSpec {
                local: Some(LocalSpec {
                    path: "/backups".into(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            resources: None,
        }
    }

    fn xdb() -> Xdb {
        let mut xdb = Xdb::new(
            "db1",
            XdbSpec {
                version: "1.0".into(),
                ..Default::default()
            },
        );
        xdb.metadata.namespace = Some("default".into());
        xdb
    }

    #[test]
    fn accepts_five_and_six_field_expressions() {
        assert!(parse_schedule("*/5 * * * *").is_ok());
        assert!(parse_schedule("0 0 3 * * *").is_ok());
        assert!(parse_schedule("@daily").is_ok());
        assert!(matches!(parse_schedule("every day"), Err(Error::ScheduleError(_))));
    }

    #[tokio::test]
    async fn tick_creates_a_labelled_snapshot() {
        let (client, server) = ApiServer::start();
        server.insert(&xdb());
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap();

        let created = create_scheduled_snapshot(&client, "default", "db1", &schedule("@daily"), at)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(created.name_any(), "db1-20240501-030000");
        assert_eq!(created.labels()[LABEL_DATABASE_NAME], "db1");
        assert_eq!(created.spec.database_name, "db1");
    }

    #[tokio::test]
    async fn tick_is_skipped_while_a_snapshot_runs() {
        let (client, server) = ApiServer::start();
        let db = xdb();
        server.insert(&db);
        let mut labels = db.offshoot_labels();
        labels.insert(LABEL_SNAPSHOT_STATUS.into(), "Running".into());
        let mut running = Snapshot::new("db1-running", SnapshotSpec::default());
        running.metadata.namespace = Some("default".into());
        running.metadata.labels = Some(labels);
        server.insert(&running);

        let out = create_scheduled_snapshot(&client, "default", "db1", &schedule("@daily"), Utc::now())
            .await
            .unwrap();
        assert!(out.is_none());
        assert!(create_scheduled_snapshot(&client, "default", "gone", &schedule("@daily"), Utc::now())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn schedules_fire_until_stopped() {
        let (client, server) = ApiServer::start();
        let db = xdb();
        server.insert(&db);
        let scheduler = CronScheduler::new(client);

        scheduler.schedule_backup(&db, &schedule("* * * * * *")).unwrap();
        assert!(scheduler.is_scheduled("default", "db1"));
        let mut fired = false;
        for _ in 0..40 {
            if !server.list::<Snapshot>("default").is_empty() {
                fired = true;
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }
        assert!(fired, "no snapshot created by the schedule");

        scheduler.stop_scheduling("default", "db1");
        assert!(!scheduler.is_scheduled("default", "db1"));
        assert!(matches!(
            scheduler.schedule_backup(&db, &schedule("not cron")),
            Err(Error::ScheduleError(_))
        ));
    }
}
