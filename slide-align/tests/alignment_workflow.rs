//! End-to-end alignment runs against the in-memory stage

use approx::assert_abs_diff_eq;
use nalgebra::Vector2;
use slide_align::presets::{load_slide_alignment, save_slide_alignment};
use slide_align::tile_config::{TILE_CONFIG_BACKUP_FILE, TILE_CONFIG_FILE};
use slide_align::{
    transform_tile_configuration, AlignmentConfig, AlignmentError, AlignmentExecutor,
    AlignmentSession, ConfirmationGate, ConfirmationPrompt, GateDecision, RefinementStrategy,
    SessionState, Tile, TransformPreset, TransformPresetStore,
};
use stage_hardware::MockStage;
use stage_math::{residual, AffineTransform2D, Correspondence};
use tempfile::tempdir;

/// Picks a reference by name and accepts until `cancel_at`
struct ScriptedOperator {
    reference: &'static str,
    cancel_at: Option<usize>,
    prompts: Vec<ConfirmationPrompt>,
}

impl ScriptedOperator {
    fn accepting(reference: &'static str) -> Self {
        Self {
            reference,
            cancel_at: None,
            prompts: Vec::new(),
        }
    }
}

impl ConfirmationGate for ScriptedOperator {
    fn select_reference(&mut self, tiles: &[Tile]) -> Option<Tile> {
        tiles.iter().find(|t| t.name == self.reference).cloned()
    }

    fn confirm_position(&mut self, prompt: &ConfirmationPrompt) -> GateDecision {
        self.prompts.push(prompt.clone());
        if self.cancel_at == Some(prompt.step) {
            GateDecision::Cancel
        } else {
            GateDecision::Accept
        }
    }
}

fn tiles() -> Vec<Tile> {
    vec![
        Tile::new("ref", 100.0, 200.0),
        Tile::new("top", 2000.0, 0.0),
        Tile::new("left", 0.0, 1500.0),
    ]
}

/// Stage where the operator always ends up on the true position of the
/// tile nearest the commanded one
fn stage_with_truth(truth: AffineTransform2D) -> MockStage {
    let targets: Vec<(f64, f64)> = tiles()
        .iter()
        .map(|t| truth.transform_point(t.centroid.x, t.centroid.y))
        .collect();

    MockStage::new().with_correction(move |x, y| {
        let mut best = targets[0];
        for &(tx, ty) in &targets {
            if (tx - x).hypot(ty - y) < (best.0 - x).hypot(best.1 - y) {
                best = (tx, ty);
            }
        }
        best
    })
}

fn config(pixel_size_um: f64, refinement: RefinementStrategy) -> AlignmentConfig {
    AlignmentConfig {
        pixel_size_um,
        refinement,
        ..Default::default()
    }
}

/// 0.3 µm pixels, slightly rotated, offset by (1000, 2000)
fn rotated_truth() -> AffineTransform2D {
    let (s, c) = 2.0_f64.to_radians().sin_cos();
    AffineTransform2D::from_coefficients([0.3 * c, 0.3 * s, -0.3 * s, 0.3 * c, 1000.0, 2000.0])
}

#[test]
fn test_reference_offset_recovered() {
    let truth = AffineTransform2D::from_coefficients([0.25, 0.0, 0.0, 0.25, 1000.0, 2000.0]);
    let mut stage = stage_with_truth(truth);
    let mut operator = ScriptedOperator::accepting("ref");
    let session = AlignmentSession::new(config(0.25, RefinementStrategy::SinglePoint), tiles())
        .unwrap();

    let result = AlignmentExecutor::new(&mut stage, &mut operator, session)
        .run()
        .unwrap()
        .unwrap();

    // First move is the pure scaling guess
    assert_eq!(stage.moves()[0], (25.0, 50.0));

    let (x, y) = result.transform_point(100.0, 200.0);
    assert_abs_diff_eq!(x, 1025.0, epsilon = 1e-9);
    assert_abs_diff_eq!(y, 2050.0, epsilon = 1e-9);

    let (x, y) = result.transform_point(0.0, 0.0);
    assert_abs_diff_eq!(x, 1000.0, epsilon = 1e-9);
    assert_abs_diff_eq!(y, 2000.0, epsilon = 1e-9);

    let steps: Vec<_> = operator.prompts.iter().map(|p| p.step).collect();
    assert_eq!(steps, vec![1, 2, 3]);
    assert!(operator.prompts.iter().all(|p| p.total_steps == 3));
}

#[test]
fn test_cancel_at_second_step_yields_nothing() {
    let mut stage = stage_with_truth(rotated_truth());
    let mut operator = ScriptedOperator {
        cancel_at: Some(2),
        ..ScriptedOperator::accepting("ref")
    };
    let session = AlignmentSession::new(config(0.25, RefinementStrategy::SinglePoint), tiles())
        .unwrap();
    let initial = *session.working_transform();

    let mut executor = AlignmentExecutor::new(&mut stage, &mut operator, session);
    assert_eq!(executor.run().unwrap(), None);

    let session = executor.session();
    assert_eq!(session.state(), &SessionState::Cancelled);
    assert_eq!(session.result(), None);
    assert_eq!(session.working_transform(), &initial);
    assert_eq!(session.correspondences().len(), 1);
    drop(executor);

    assert_eq!(stage.moves().len(), 2);
    assert_eq!(operator.prompts.len(), 2);
}

#[test]
fn test_stage_move_failure_aborts() {
    let mut stage = stage_with_truth(rotated_truth()).fail_move_at(1);
    let mut operator = ScriptedOperator::accepting("ref");
    let session = AlignmentSession::new(config(0.25, RefinementStrategy::SinglePoint), tiles())
        .unwrap();

    let mut executor = AlignmentExecutor::new(&mut stage, &mut operator, session);
    let err = executor.run().unwrap_err();

    assert!(matches!(err, AlignmentError::MoveFailed { step: 2, .. }));
    assert!(matches!(executor.session().state(), SessionState::Failed(_)));
    assert_eq!(executor.session().result(), None);
    drop(executor);

    // The operator never saw the tile the stage failed to reach
    assert_eq!(operator.prompts.len(), 1);
}

#[test]
fn test_single_point_keeps_only_latest_tile_exact() {
    // Configured pixel size is wrong, so the linear part is never corrected
    let truth = rotated_truth();
    let mut stage = stage_with_truth(truth);
    let mut operator = ScriptedOperator::accepting("ref");
    let session = AlignmentSession::new(config(0.25, RefinementStrategy::SinglePoint), tiles())
        .unwrap();

    let result = AlignmentExecutor::new(&mut stage, &mut operator, session)
        .run()
        .unwrap()
        .unwrap();

    let exact_at = |tile: &Tile| {
        let (x, y) = truth.transform_point(tile.centroid.x, tile.centroid.y);
        let c = Correspondence::new(tile.centroid, Vector2::new(x, y));
        residual(&result, &c).norm()
    };

    let last = &operator.prompts[2].tile;
    let reference = &operator.prompts[0].tile;
    assert_eq!(last.name, "left");
    assert_abs_diff_eq!(exact_at(last), 0.0, epsilon = 1e-9);
    assert!(exact_at(reference) > 1.0);
}

#[test]
fn test_least_squares_recovers_full_transform() {
    let truth = rotated_truth();
    let mut stage = stage_with_truth(truth);
    let mut operator = ScriptedOperator::accepting("ref");
    let session = AlignmentSession::new(config(0.25, RefinementStrategy::LeastSquares), tiles())
        .unwrap();

    let result = AlignmentExecutor::new(&mut stage, &mut operator, session)
        .run()
        .unwrap()
        .unwrap();

    for (got, want) in result.coefficients().iter().zip(truth.coefficients()) {
        assert_abs_diff_eq!(*got, want, epsilon = 1e-6);
    }
}

#[test]
fn test_result_persists_and_rewrites_tiles() {
    let truth = AffineTransform2D::from_coefficients([0.25, 0.0, 0.0, 0.25, 1000.0, 2000.0]);
    let mut stage = stage_with_truth(truth);
    let mut operator = ScriptedOperator::accepting("ref");
    let session = AlignmentSession::new(config(0.25, RefinementStrategy::SinglePoint), tiles())
        .unwrap();
    let result = AlignmentExecutor::new(&mut stage, &mut operator, session)
        .run()
        .unwrap()
        .unwrap();

    let dir = tempdir().unwrap();

    let mut store = TransformPresetStore::open(dir.path()).unwrap();
    store
        .save_preset(TransformPreset::new("slide-1", "scope-a", "standard", result))
        .unwrap();
    let reopened = TransformPresetStore::open(dir.path()).unwrap();
    assert_eq!(reopened.get("slide-1").unwrap().transform, result);

    save_slide_alignment(dir.path(), "sample-1", "brightfield", &result).unwrap();
    let loaded = load_slide_alignment(dir.path(), "sample-1").unwrap().unwrap();
    for (got, want) in loaded.coefficients().iter().zip(result.coefficients()) {
        assert_abs_diff_eq!(*got, want, epsilon = 1e-9);
    }

    let region = dir.path().join("region_1");
    std::fs::create_dir(&region).unwrap();
    std::fs::write(
        region.join(TILE_CONFIG_FILE),
        "dim = 2\n0001.tif; ; (0.0, 0.0)\n0002.tif; ; (400.0, 0.0)\n",
    )
    .unwrap();

    let modified = transform_tile_configuration(dir.path(), &result).unwrap();
    assert_eq!(modified, vec!["region_1"]);
    assert!(region.join(TILE_CONFIG_BACKUP_FILE).exists());

    let rewritten = std::fs::read_to_string(region.join(TILE_CONFIG_FILE)).unwrap();
    assert!(rewritten.contains("0001.tif; ; (1000.000, 2000.000)"));
    assert!(rewritten.contains("0002.tif; ; (1100.000, 2000.000)"));
}
