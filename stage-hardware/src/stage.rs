//! Stage abstraction
//!
//! The alignment workflow only ever needs two things from a stage: command an
//! XY move and read back the XY position. Both are blocking; a call returns
//! once the stage has settled or the driver has given up.

use thiserror::Error;

/// Errors reported by stage drivers
#[derive(Error, Debug)]
pub enum StageError {
    /// Server or controller rejected or failed the request
    #[error("stage communication error: {0}")]
    Communication(String),

    /// Transport failure
    #[error("stage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Reply could not be interpreted
    #[error("stage protocol error: {0}")]
    Protocol(String),

    /// No connection could be established
    #[error("stage not connected: {0}")]
    NotConnected(String),
}

/// Result type for stage operations
pub type StageResult<T> = Result<T, StageError>;

/// XY stage control
///
/// Coordinates are in the stage's physical units (µm for the microscope
/// server).
pub trait StageInterface {
    /// Move to an absolute XY position
    fn move_xy(&mut self, x: f64, y: f64) -> StageResult<()>;

    /// Read the current XY position
    fn position_xy(&mut self) -> StageResult<(f64, f64)>;

    /// Short human-readable driver name for logs
    fn name(&self) -> &str {
        "stage"
    }
}

impl<S: StageInterface + ?Sized> StageInterface for &mut S {
    fn move_xy(&mut self, x: f64, y: f64) -> StageResult<()> {
        (**self).move_xy(x, y)
    }

    fn position_xy(&mut self) -> StageResult<(f64, f64)> {
        (**self).position_xy()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

impl<S: StageInterface + ?Sized> StageInterface for Box<S> {
    fn move_xy(&mut self, x: f64, y: f64) -> StageResult<()> {
        (**self).move_xy(x, y)
    }

    fn position_xy(&mut self) -> StageResult<(f64, f64)> {
        (**self).position_xy()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
