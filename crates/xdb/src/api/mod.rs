pub mod v1alpha1;

pub const GROUP: &str = "kubedb.com";
pub const DATABASE_NAME_PREFIX: &str = "kubedb";

pub const GENERIC_KEY_PREFIX: &str = "kubedb.com/";
pub const XDB_KEY_PREFIX: &str = "xdbs.kubedb.com/";

pub const LABEL_DATABASE_KIND: &str = "kubedb.com/kind";
pub const LABEL_DATABASE_NAME: &str = "kubedb.com/name";
pub const LABEL_JOB_TYPE: &str = "kubedb.com/job-type";
pub const LABEL_SNAPSHOT_STATUS: &str = "snapshots.kubedb.com/status";

pub const ANNOTATION_XDB_VERSION: &str = "xdbs.kubedb.com/version";
pub const ANNOTATION_XDB_INIT: &str = "xdbs.kubedb.com/init";
pub const ANNOTATION_XDB_IGNORE: &str = "xdbs.kubedb.com/ignore";

pub const JOB_TYPE_BACKUP: &str = "backup";
pub const JOB_TYPE_RESTORE: &str = "restore";

pub const AGENT_COREOS_PROMETHEUS: &str = "coreos-prometheus-operator";
pub const PROMETHEUS_EXPORTER_PORT_NUMBER: i32 = 56790;
pub const PROMETHEUS_EXPORTER_PORT_NAME: &str = "http";
