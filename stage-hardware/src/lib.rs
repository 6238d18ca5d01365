//! stage-hardware - Microscope stage drivers
//!
//! - [`stage`] - the `StageInterface` trait every stage driver implements
//! - [`mock`] - in-memory stage for tests and dry runs
//! - [`socket`] - TCP client for the microscope control server

pub mod mock;
pub mod socket;
pub mod stage;

pub use mock::MockStage;
pub use socket::{MicroscopeSocketClient, SocketCommand, SocketConfig};
pub use stage::{StageError, StageInterface, StageResult};
