use thiserror::Error;

pub type ModuleResult<T> = Result<T, ModuleError>;

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error(
        "requested volume {requested_ul} uL is below the {minimum_ul} uL the valve can reliably dispense"
    )]
    VolumeTooSmall { requested_ul: f64, minimum_ul: f64 },

    #[error("calibration fit failed to converge: {0}")]
    FitDiverged(&'static str),

    #[error("invalid calibration data: {0}")]
    InvalidCalibration(&'static str),

    #[error("module is not registered with a controller; command queue unavailable")]
    NotRegistered,

    #[error("controller command queue is closed")]
    QueueClosed,

    #[error(transparent)]
    Tracker(#[from] tracker::TrackerError),
}
