use thiserror::Error;

/// Invariant violations.
///
/// Everything else (transport hiccups, disk errors, classifier or delivery
/// failures) is absorbed where it happens. These indicate a construction-time
/// defect and are allowed to terminate the loop that hits them.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("frame received for unconfigured camera {0:?}")]
    UnknownCamera(String),
    #[error("camera id {0:?} is configured more than once")]
    DuplicateCamera(String),
    #[error("acquisition thread for camera {0:?} panicked")]
    AcquisitionPanicked(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
