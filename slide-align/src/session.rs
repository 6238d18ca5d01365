//! Sequential refinement state machine
//!
//! The session owns the working transform and decides what happens next; it
//! never touches hardware or the operator directly. Callers feed it
//! [`SessionEvent`]s describing what happened and perform the
//! [`SessionAction`]s it returns. This keeps the workflow independent of
//! whichever UI or stage sits around it.
//!
//! ```text
//! AwaitingReferenceSelection
//!   -> MovedToGuess -> AwaitingPositionConfirmation -> RefinedPrimary
//!   -> (MovedToExtra -> AwaitingConfirmation -> RefinedExtra)*
//!   -> Done | Cancelled | Failed
//! ```
//!
//! At most one move or refinement is outstanding at any time. There is no
//! timeout on confirmation; the session waits as long as the caller does.

use nalgebra::Vector2;
use stage_math::{AffineTransform2D, Correspondence};
use tracing::{debug, error, info, warn};

use crate::config::AlignmentConfig;
use crate::error::AlignmentError;
use crate::tiles::{ReferenceTileSet, Tile};

/// Alignment session states
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// Waiting for the operator to pick a reference tile
    AwaitingReferenceSelection,
    /// Stage commanded to the predicted reference position
    MovedToGuess,
    /// Stage at the predicted reference position, waiting for the operator
    AwaitingPositionConfirmation,
    /// Reference correspondence folded in (transient)
    RefinedPrimary,
    /// Stage commanded to extra tile `index` (0-based among extras)
    MovedToExtra { index: usize },
    /// Stage at extra tile `index`, waiting for the operator
    AwaitingConfirmation { index: usize },
    /// Extra correspondence folded in (transient)
    RefinedExtra { index: usize },
    /// All tiles confirmed
    Done,
    /// Operator cancelled; no transform is produced
    Cancelled,
    /// Stage failure; no transform is produced
    Failed(AlignmentError),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Done | SessionState::Cancelled | SessionState::Failed(_)
        )
    }
}

/// Inputs to the session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ReferenceSelected(Tile),
    MoveCompleted,
    MoveFailed(String),
    /// Operator accepted; `measured` is the stage position read afterwards
    Confirm { measured: Vector2<f64> },
    PositionReadFailed(String),
    Cancel,
}

/// What the operator is asked to confirm
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmationPrompt {
    /// 1-based step number
    pub step: usize,
    pub total_steps: usize,
    pub tile: Tile,
    /// Stage position the current transform predicts for the tile
    pub predicted: Vector2<f64>,
}

impl ConfirmationPrompt {
    pub fn is_reference(&self) -> bool {
        self.step == 1
    }
}

/// Work the caller must perform, in order
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    MoveStage { x: f64, y: f64 },
    RequestConfirmation(ConfirmationPrompt),
    Refined { step: usize, transform: AffineTransform2D },
    Completed(AffineTransform2D),
    Cancelled,
    Failed(AlignmentError),
}

/// One interactive alignment of a slide to the stage
#[derive(Debug)]
pub struct AlignmentSession {
    config: AlignmentConfig,
    tiles: Vec<Tile>,
    state: SessionState,
    transform: AffineTransform2D,
    plan: Option<ReferenceTileSet>,
    correspondences: Vec<Correspondence>,
}

impl AlignmentSession {
    /// Start a session over `tiles`, the candidates for the automatic extras
    pub fn new(config: AlignmentConfig, tiles: Vec<Tile>) -> Result<Self, AlignmentError> {
        config
            .validate()
            .map_err(|e| AlignmentError::InvalidConfig(e.to_string()))?;

        let transform = config.initial_transform();
        info!(
            "Alignment session started: {} tiles, pixel size {} µm, initial transform {}",
            tiles.len(),
            config.pixel_size_um,
            transform
        );

        Ok(Self {
            config,
            tiles,
            state: SessionState::AwaitingReferenceSelection,
            transform,
            plan: None,
            correspondences: Vec::new(),
        })
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn config(&self) -> &AlignmentConfig {
        &self.config
    }

    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    /// Tiles chosen for this session, once the reference is known
    pub fn plan(&self) -> Option<&ReferenceTileSet> {
        self.plan.as_ref()
    }

    /// Transform as refined so far
    pub fn working_transform(&self) -> &AffineTransform2D {
        &self.transform
    }

    pub fn correspondences(&self) -> &[Correspondence] {
        &self.correspondences
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Final transform; only a completed session has one
    pub fn result(&self) -> Option<AffineTransform2D> {
        match self.state {
            SessionState::Done => Some(self.transform),
            _ => None,
        }
    }

    fn total_steps(&self) -> usize {
        self.plan.as_ref().map_or(0, ReferenceTileSet::len)
    }

    fn transition(&mut self, next: SessionState) {
        debug!("Alignment state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Process one event and return the actions it triggers
    ///
    /// Events that do not apply to the current state are logged and ignored.
    pub fn process_event(&mut self, event: SessionEvent) -> Vec<SessionAction> {
        use SessionState::*;

        match (&self.state, event) {
            (state, SessionEvent::Cancel) if !state.is_terminal() => self.handle_cancel(),

            (AwaitingReferenceSelection, SessionEvent::ReferenceSelected(tile)) => {
                self.handle_reference_selected(tile)
            }

            (MovedToGuess, SessionEvent::MoveCompleted) => {
                self.transition(AwaitingPositionConfirmation);
                self.prompt_for(0)
            }
            (MovedToExtra { index }, SessionEvent::MoveCompleted) => {
                let index = *index;
                self.transition(AwaitingConfirmation { index });
                self.prompt_for(index + 1)
            }

            (MovedToGuess, SessionEvent::MoveFailed(reason)) => self.fail(
                AlignmentError::MoveFailed { step: 1, reason },
            ),
            (MovedToExtra { index }, SessionEvent::MoveFailed(reason)) => {
                let step = index + 2;
                self.fail(AlignmentError::MoveFailed { step, reason })
            }

            (AwaitingPositionConfirmation, SessionEvent::Confirm { measured }) => {
                self.handle_confirm(0, measured)
            }
            (AwaitingConfirmation { index }, SessionEvent::Confirm { measured }) => {
                let step_index = index + 1;
                self.handle_confirm(step_index, measured)
            }

            (AwaitingPositionConfirmation, SessionEvent::PositionReadFailed(reason)) => self.fail(
                AlignmentError::PositionReadFailed { step: 1, reason },
            ),
            (AwaitingConfirmation { index }, SessionEvent::PositionReadFailed(reason)) => {
                let step = index + 2;
                self.fail(AlignmentError::PositionReadFailed { step, reason })
            }

            (state, event) => {
                warn!("Ignoring event {event:?} in state {state:?}");
                vec![]
            }
        }
    }

    fn handle_reference_selected(&mut self, reference: Tile) -> Vec<SessionAction> {
        let plan = ReferenceTileSet::select(reference, &self.tiles, self.config.max_extra_points);
        info!(
            "Reference tile '{}' selected; {} extra tile(s) to confirm",
            plan.reference().name,
            plan.extras().len()
        );
        for (i, tile) in plan.extras().iter().enumerate() {
            debug!(
                "Extra tile {}: '{}' at ({:.1}, {:.1})",
                i + 1,
                tile.name,
                tile.centroid.x,
                tile.centroid.y
            );
        }

        let target = self.transform.apply(&plan.reference().centroid);
        self.plan = Some(plan);
        self.transition(SessionState::MovedToGuess);

        vec![SessionAction::MoveStage {
            x: target.x,
            y: target.y,
        }]
    }

    /// Confirmation request for 0-based `step_index`
    fn prompt_for(&mut self, step_index: usize) -> Vec<SessionAction> {
        let Some(tile) = self.plan.as_ref().and_then(|p| p.get(step_index)) else {
            return self.fail(AlignmentError::Stalled(format!("{:?}", self.state)));
        };

        vec![SessionAction::RequestConfirmation(ConfirmationPrompt {
            step: step_index + 1,
            total_steps: self.total_steps(),
            tile: tile.clone(),
            predicted: self.transform.apply(&tile.centroid),
        })]
    }

    fn handle_confirm(&mut self, step_index: usize, measured: Vector2<f64>) -> Vec<SessionAction> {
        let Some(tile) = self.plan.as_ref().and_then(|p| p.get(step_index)) else {
            return self.fail(AlignmentError::Stalled(format!("{:?}", self.state)));
        };

        let correspondence = Correspondence::new(tile.centroid, measured);
        self.correspondences.push(correspondence);
        self.transform = self
            .config
            .refinement
            .apply(&self.transform, &self.correspondences);

        let step = step_index + 1;
        info!(
            "Step {step}/{}: tile '{}' confirmed at ({:.3}, {:.3}); transform {}",
            self.total_steps(),
            tile.name,
            measured.x,
            measured.y,
            self.transform
        );

        if step_index == 0 {
            self.transition(SessionState::RefinedPrimary);
        } else {
            self.transition(SessionState::RefinedExtra {
                index: step_index - 1,
            });
        }

        let mut actions = vec![SessionAction::Refined {
            step,
            transform: self.transform,
        }];
        actions.extend(self.advance(step_index + 1));
        actions
    }

    /// Move on to 0-based `step_index`, or finish when no tile is left
    fn advance(&mut self, step_index: usize) -> Vec<SessionAction> {
        let next = self
            .plan
            .as_ref()
            .and_then(|p| p.get(step_index))
            .map(|tile| self.transform.apply(&tile.centroid));

        match next {
            Some(target) => {
                self.transition(SessionState::MovedToExtra {
                    index: step_index - 1,
                });
                vec![SessionAction::MoveStage {
                    x: target.x,
                    y: target.y,
                }]
            }
            None => {
                info!("Alignment complete: {}", self.transform);
                self.transition(SessionState::Done);
                vec![SessionAction::Completed(self.transform)]
            }
        }
    }

    fn handle_cancel(&mut self) -> Vec<SessionAction> {
        info!(
            "Alignment cancelled by operator after {} confirmed tile(s); transform discarded",
            self.correspondences.len()
        );
        self.transform = self.config.initial_transform();
        self.transition(SessionState::Cancelled);
        vec![SessionAction::Cancelled]
    }

    fn fail(&mut self, err: AlignmentError) -> Vec<SessionAction> {
        error!("Alignment failed: {err}");
        self.transform = self.config.initial_transform();
        self.transition(SessionState::Failed(err.clone()));
        vec![SessionAction::Failed(err)]
    }
}
