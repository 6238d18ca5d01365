//! slide-align - Interactive slide-to-stage alignment
//!
//! Maps pixel coordinates of a scanned slide image onto microscope stage
//! coordinates. An alignment starts from a pure scaling transform built from
//! the pixel size and axis inversions, then the operator confirms the stage
//! position over a reference tile and up to two extra tiles. Each
//! confirmation refines the working transform.
//!
//! States: AwaitingReferenceSelection -> MovedToGuess -> AwaitingPositionConfirmation
//! -> RefinedPrimary -> (MovedToExtra -> AwaitingConfirmation -> RefinedExtra)* -> Done

pub mod config;
pub mod error;
pub mod executor;
pub mod green_box;
pub mod heartbeat;
pub mod presets;
pub mod refine;
pub mod session;
pub mod tile_config;
pub mod tiles;
pub mod tiling;

pub use crate::config::{AlignmentConfig, ConfigError, StageBounds};
pub use crate::error::AlignmentError;
pub use crate::executor::{AlignmentExecutor, ConfirmationGate, GateDecision};
pub use crate::green_box::{detect_green_box, green_box_transform, GreenBox, GreenBoxParams};
pub use crate::heartbeat::{run_heartbeat_client, HeartbeatError, HeartbeatOutcome, HeartbeatServer};
pub use crate::presets::{PresetError, TransformPreset, TransformPresetStore};
pub use crate::refine::{refine, RefinementStrategy};
pub use crate::session::{
    AlignmentSession, ConfirmationPrompt, SessionAction, SessionEvent, SessionState,
};
pub use crate::tile_config::{find_image_boundaries, transform_tile_configuration, TileConfigError};
pub use crate::tiles::{ReferenceTileSet, Tile};
pub use crate::tiling::{
    generate_tile_grid, tile_bounding_box, write_tile_configuration, TileGridParams, TileRegion,
    TilingError,
};
