//! Blocking alignment driver
//!
//! Runs an [`AlignmentSession`] to completion against a stage and an
//! operator. Stage results and operator decisions are turned into session
//! events; session actions are carried out in the order they are returned.

use std::collections::VecDeque;

use nalgebra::Vector2;
use stage_hardware::StageInterface;
use stage_math::AffineTransform2D;
use tracing::{error, info};

use crate::error::AlignmentError;
use crate::session::{AlignmentSession, ConfirmationPrompt, SessionAction, SessionEvent};
use crate::tiles::Tile;

/// Operator answer to a confirmation prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Stage is on the tile (possibly after manual adjustment)
    Accept,
    /// Abandon the alignment
    Cancel,
}

/// Operator interaction
///
/// Both calls block until the operator answers. There is no timeout.
pub trait ConfirmationGate {
    /// Pick the reference tile, or `None` to cancel
    fn select_reference(&mut self, tiles: &[Tile]) -> Option<Tile>;

    /// Confirm the stage is on `prompt.tile`
    fn confirm_position(&mut self, prompt: &ConfirmationPrompt) -> GateDecision;
}

impl<G: ConfirmationGate + ?Sized> ConfirmationGate for &mut G {
    fn select_reference(&mut self, tiles: &[Tile]) -> Option<Tile> {
        (**self).select_reference(tiles)
    }

    fn confirm_position(&mut self, prompt: &ConfirmationPrompt) -> GateDecision {
        (**self).confirm_position(prompt)
    }
}

/// Drives one alignment session
pub struct AlignmentExecutor<S: StageInterface, G: ConfirmationGate> {
    stage: S,
    gate: G,
    session: AlignmentSession,
}

impl<S: StageInterface, G: ConfirmationGate> AlignmentExecutor<S, G> {
    pub fn new(stage: S, gate: G, session: AlignmentSession) -> Self {
        Self {
            stage,
            gate,
            session,
        }
    }

    pub fn session(&self) -> &AlignmentSession {
        &self.session
    }

    pub fn into_parts(self) -> (S, G, AlignmentSession) {
        (self.stage, self.gate, self.session)
    }

    /// Run until the session finishes
    ///
    /// # Returns
    /// * `Ok(Some(transform))` - every tile confirmed
    /// * `Ok(None)` - operator cancelled
    /// * `Err(AlignmentError)` - stage failure
    pub fn run(&mut self) -> Result<Option<AffineTransform2D>, AlignmentError> {
        info!("Starting alignment with {} stage", self.stage.name());

        let first_event = match self.gate.select_reference(self.session.tiles()) {
            Some(tile) => SessionEvent::ReferenceSelected(tile),
            None => SessionEvent::Cancel,
        };

        let mut pending: VecDeque<SessionAction> =
            self.session.process_event(first_event).into();

        while let Some(action) = pending.pop_front() {
            let event = match action {
                SessionAction::MoveStage { x, y } => Some(self.move_stage(x, y)),
                SessionAction::RequestConfirmation(prompt) => Some(self.confirm(&prompt)),
                SessionAction::Refined { step, transform } => {
                    info!(
                        "Step {step} refined: {transform} (skew {:.3} deg)",
                        transform.skew_degrees()
                    );
                    None
                }
                SessionAction::Completed(transform) => return Ok(Some(transform)),
                SessionAction::Cancelled => return Ok(None),
                SessionAction::Failed(err) => return Err(err),
            };

            if let Some(event) = event {
                pending.extend(self.session.process_event(event));
            }
        }

        Err(AlignmentError::Stalled(format!("{:?}", self.session.state())))
    }

    fn move_stage(&mut self, x: f64, y: f64) -> SessionEvent {
        info!("Moving stage to predicted position ({x:.3}, {y:.3})");
        match self.stage.move_xy(x, y) {
            Ok(()) => SessionEvent::MoveCompleted,
            Err(e) => {
                error!("Stage move to ({x:.3}, {y:.3}) failed: {e}");
                SessionEvent::MoveFailed(e.to_string())
            }
        }
    }

    fn confirm(&mut self, prompt: &ConfirmationPrompt) -> SessionEvent {
        match self.gate.confirm_position(prompt) {
            GateDecision::Cancel => SessionEvent::Cancel,
            GateDecision::Accept => match self.stage.position_xy() {
                Ok((x, y)) => SessionEvent::Confirm {
                    measured: Vector2::new(x, y),
                },
                Err(e) => {
                    error!("Reading stage position failed: {e}");
                    SessionEvent::PositionReadFailed(e.to_string())
                }
            },
        }
    }
}
