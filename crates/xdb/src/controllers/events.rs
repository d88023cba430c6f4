//! Event reasons shown to users on the objects the operator manages.

pub const CREATING: &str = "Creating";
pub const SUCCESSFUL_CREATE: &str = "SuccessfulCreate";
pub const FAILED_TO_CREATE: &str = "FailedToCreate";
pub const INVALID: &str = "Invalid";
pub const SUCCESSFUL_VALIDATE: &str = "SuccessfulValidate";
pub const FAILED_TO_START: &str = "FailedToStart";
pub const INITIALIZING: &str = "Initializing";
pub const SUCCESSFUL_INITIALIZE: &str = "SuccessfulInitialize";
pub const FAILED_TO_INITIALIZE: &str = "FailedToInitialize";
pub const PAUSING: &str = "Pausing";
pub const SUCCESSFUL_PAUSE: &str = "SuccessfulPause";
pub const FAILED_TO_PAUSE: &str = "FailedToPause";
pub const RESUMING: &str = "Resuming";
pub const SUCCESSFUL_RESUME: &str = "SuccessfulResume";
pub const FAILED_TO_RESUME: &str = "FailedToResume";
pub const WIPING_OUT: &str = "WipingOut";
pub const SUCCESSFUL_WIPE_OUT: &str = "SuccessfulWipeOut";
pub const FAILED_TO_WIPE_OUT: &str = "FailedToWipeOut";
pub const IGNORED: &str = "Ignored";
pub const FAILED_TO_UPDATE: &str = "FailedToUpdate";
pub const FAILED_TO_GET: &str = "FailedToGet";
pub const FAILED_TO_DELETE: &str = "FailedToDelete";
pub const FAILED_TO_LIST: &str = "FailedToList";
pub const FAILED_TO_SCHEDULE: &str = "FailedToSchedule";
pub const STARTING: &str = "Starting";
pub const SUCCESSFUL_SNAPSHOT: &str = "SuccessfulSnapshot";
pub const FAILED_SNAPSHOT: &str = "FailedSnapshot";
pub const SUCCESSFUL_MONITOR_ADD: &str = "SuccessfulMonitorAdd";
pub const SUCCESSFUL_MONITOR_UPDATE: &str = "SuccessfulMonitorUpdate";
pub const SUCCESSFUL_MONITOR_DELETE: &str = "SuccessfulMonitorDelete";
pub const FAILED_TO_ADD_MONITOR: &str = "FailedToAddMonitor";
pub const FAILED_TO_UPDATE_MONITOR: &str = "FailedToUpdateMonitor";
pub const FAILED_TO_DELETE_MONITOR: &str = "FailedToDeleteMonitor";
