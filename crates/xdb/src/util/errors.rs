use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("JsonSerializationError: {0}")]
    JsonSerializationError(#[source] serde_json::Error),

    #[error("YamlSerializationError: {0}")]
    YamlSerializationError(#[source] serde_yaml::Error),

    #[error("MetadataMissing: {0}")]
    MetadataMissing(String),

    #[error("ValidationError: {0}")]
    ValidationError(String),

    #[error("NotFound: {0}")]
    NotFound(String),

    #[error("failed to patch {kind} {name} after {attempts} attempts: {reason}")]
    PatchFailed {
        kind: String,
        name: String,
        attempts: u32,
        reason: String,
    },

    #[error("ProvisioningError: {0}")]
    ProvisioningError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("StorageError: {0}")]
    StorageError(String),

    #[error("ScheduleError: {0}")]
    ScheduleError(String),

    #[error("HttpError: {0}")]
    HttpError(String),

    #[error("MetricsError: {0}")]
    MetricsError(#[source] prometheus::Error),
}

impl Error {
    pub fn metric_label(&self) -> String {
        let label = match self {
            Error::KubeError(_) => "kubeerror",
            Error::JsonSerializationError(_) => "jsonserializationerror",
            Error::YamlSerializationError(_) => "yamlserializationerror",
            Error::MetadataMissing(_) => "metadatamissing",
            Error::ValidationError(_) => "validationerror",
            Error::NotFound(_) => "notfound",
            Error::PatchFailed { .. } => "patchfailed",
            Error::ProvisioningError(_) => "provisioningerror",
            Error::Timeout(_) => "timeout",
            Error::StorageError(_) => "storageerror",
            Error::ScheduleError(_) => "scheduleerror",
            Error::HttpError(_) => "httperror",
            Error::MetricsError(_) => "metricserror",
        };
        label.to_string()
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::KubeError(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::JsonSerializationError(e)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// True when the API server answered 404.
pub fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(err) if err.code == 404)
}

/// True when the API server answered 409.
pub fn is_conflict(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(err) if err.code == 409)
}
