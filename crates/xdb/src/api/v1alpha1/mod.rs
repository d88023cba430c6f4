pub mod dormant_database;
pub mod snapshot;
pub mod storage;
pub mod volume;
pub mod xdb;

pub use dormant_database::{
    DormantDatabase, DormantDatabasePhase, DormantDatabaseSpec, DormantDatabaseStatus, Origin, OriginMeta,
    OriginSpec,
};
pub use snapshot::{Snapshot, SnapshotPhase, SnapshotSpec, SnapshotStatus};
pub use storage::{Backend, Provider, SnapshotStorageSpec};
pub use volume::VolumeSource;
pub use xdb::{
    BackupScheduleSpec, DatabasePhase, InitSpec, MonitorSpec, PrometheusSpec, ScriptSourceSpec,
    SnapshotSourceSpec, Xdb, XdbSpec, XdbStatus,
};
