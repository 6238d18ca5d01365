use tracing::debug;

use crate::stage::{StageError, StageInterface, StageResult};

type Correction = Box<dyn FnMut(f64, f64) -> (f64, f64) + Send>;

/// In-memory stage
///
/// Every commanded move is recorded. After a move the reported position is
/// the commanded one passed through an optional correction, which stands in
/// for the operator nudging the stage onto the real feature before
/// confirming.
pub struct MockStage {
    position: (f64, f64),
    moves: Vec<(f64, f64)>,
    reads: usize,
    correction: Option<Correction>,
    fail_move_at: Option<usize>,
    fail_read_at: Option<usize>,
}

impl MockStage {
    pub fn new() -> Self {
        Self::at(0.0, 0.0)
    }

    pub fn at(x: f64, y: f64) -> Self {
        Self {
            position: (x, y),
            moves: Vec::new(),
            reads: 0,
            correction: None,
            fail_move_at: None,
            fail_read_at: None,
        }
    }

    /// Map each commanded position to where the stage actually ends up
    pub fn with_correction<F>(mut self, correction: F) -> Self
    where
        F: FnMut(f64, f64) -> (f64, f64) + Send + 'static,
    {
        self.correction = Some(Box::new(correction));
        self
    }

    /// Fail the `index`-th move (0-based)
    pub fn fail_move_at(mut self, index: usize) -> Self {
        self.fail_move_at = Some(index);
        self
    }

    /// Fail the `index`-th position read (0-based)
    pub fn fail_read_at(mut self, index: usize) -> Self {
        self.fail_read_at = Some(index);
        self
    }

    /// Commanded moves in order
    pub fn moves(&self) -> &[(f64, f64)] {
        &self.moves
    }

    pub fn position(&self) -> (f64, f64) {
        self.position
    }
}

impl Default for MockStage {
    fn default() -> Self {
        Self::new()
    }
}

impl StageInterface for MockStage {
    fn move_xy(&mut self, x: f64, y: f64) -> StageResult<()> {
        let index = self.moves.len();
        self.moves.push((x, y));

        if self.fail_move_at == Some(index) {
            return Err(StageError::Communication(format!(
                "injected failure on move {index}"
            )));
        }

        self.position = match self.correction.as_mut() {
            Some(correct) => correct(x, y),
            None => (x, y),
        };
        debug!(
            "Mock stage moved to ({:.3}, {:.3}), settled at ({:.3}, {:.3})",
            x, y, self.position.0, self.position.1
        );
        Ok(())
    }

    fn position_xy(&mut self) -> StageResult<(f64, f64)> {
        let index = self.reads;
        self.reads += 1;

        if self.fail_read_at == Some(index) {
            return Err(StageError::NotConnected(format!(
                "injected failure on read {index}"
            )));
        }

        Ok(self.position)
    }

    fn name(&self) -> &str {
        "MockStage"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_records_moves() {
        let mut stage = MockStage::new();
        stage.move_xy(1.0, 2.0).unwrap();
        stage.move_xy(3.0, 4.0).unwrap();

        assert_eq!(stage.moves(), &[(1.0, 2.0), (3.0, 4.0)]);
        assert_eq!(stage.position_xy().unwrap(), (3.0, 4.0));
    }

    #[test]
    fn test_correction_applied_after_move() {
        let mut stage = MockStage::new().with_correction(|x, y| (x + 10.0, y - 5.0));
        stage.move_xy(100.0, 200.0).unwrap();

        let (x, y) = stage.position_xy().unwrap();
        assert_relative_eq!(x, 110.0);
        assert_relative_eq!(y, 195.0);
    }

    #[test]
    fn test_injected_failures() {
        let mut stage = MockStage::at(5.0, 5.0).fail_move_at(1).fail_read_at(0);

        assert!(matches!(
            stage.position_xy(),
            Err(StageError::NotConnected(_))
        ));
        assert!(stage.position_xy().is_ok());

        stage.move_xy(1.0, 1.0).unwrap();
        assert!(matches!(
            stage.move_xy(2.0, 2.0),
            Err(StageError::Communication(_))
        ));
        // Failed move leaves the stage where it was
        assert_eq!(stage.position(), (1.0, 1.0));
    }

    #[test]
    fn test_usable_through_mut_reference() {
        fn drive<S: StageInterface>(mut stage: S) -> StageResult<(f64, f64)> {
            stage.move_xy(7.0, 8.0)?;
            stage.position_xy()
        }

        let mut stage = MockStage::new();
        assert_eq!(drive(&mut stage).unwrap(), (7.0, 8.0));
        assert_eq!(stage.moves().len(), 1);
    }
}
