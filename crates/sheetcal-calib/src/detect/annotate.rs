//! Manual annotation as an explicit state machine.
//!
//! The session is fed point batches by whatever front end collects the
//! clicks; it never reads input itself.

use super::manual::ManualAnnotations;
use serde::{Deserialize, Serialize};

/// Lines an operator must trace before a session can finish.
pub const DEFAULT_REQUIRED_LINES: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AnnotationState {
    /// Waiting for line number `index` (zero based).
    AwaitingLine { index: usize },
    /// Enough lines traced; more lines and landmarks are still accepted.
    Ready,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AnnotationError {
    #[error("line `{line}` has {found} points, at least 2 required")]
    TooFewPoints { line: String, found: usize },
    #[error("line `{0}` was already traced")]
    DuplicateLine(String),
    #[error("annotation incomplete: {traced} of {required} lines traced")]
    NotReady { traced: usize, required: usize },
}

#[derive(Clone, Debug)]
pub struct AnnotationSession {
    required_lines: usize,
    state: AnnotationState,
    annotations: ManualAnnotations,
}

impl Default for AnnotationSession {
    fn default() -> Self {
        Self::new(DEFAULT_REQUIRED_LINES)
    }
}

impl AnnotationSession {
    pub fn new(required_lines: usize) -> Self {
        Self {
            required_lines,
            state: Self::state_for(0, required_lines),
            annotations: ManualAnnotations::default(),
        }
    }

    fn state_for(traced: usize, required: usize) -> AnnotationState {
        if traced >= required {
            AnnotationState::Ready
        } else {
            AnnotationState::AwaitingLine { index: traced }
        }
    }

    pub fn state(&self) -> AnnotationState {
        self.state
    }

    pub fn traced_lines(&self) -> usize {
        self.annotations.lines.len()
    }

    /// Id used by [`Self::submit_unnamed_line`] for the next line.
    pub fn next_line_id(&self) -> String {
        format!("line_{}", self.traced_lines())
    }

    /// Record one traced line. A rejected batch leaves the state unchanged.
    pub fn submit_line(
        &mut self,
        id: impl Into<String>,
        points: Vec<[f64; 2]>,
    ) -> Result<AnnotationState, AnnotationError> {
        let id = id.into();
        if points.len() < 2 {
            return Err(AnnotationError::TooFewPoints {
                line: id,
                found: points.len(),
            });
        }
        if self.annotations.lines.contains_key(&id) {
            return Err(AnnotationError::DuplicateLine(id));
        }
        self.annotations.lines.insert(id, points);
        self.state = Self::state_for(self.traced_lines(), self.required_lines);
        Ok(self.state)
    }

    pub fn submit_unnamed_line(
        &mut self,
        points: Vec<[f64; 2]>,
    ) -> Result<AnnotationState, AnnotationError> {
        let id = self.next_line_id();
        self.submit_line(id, points)
    }

    /// Landmarks can be placed in any state; a repeated name moves the mark.
    pub fn submit_landmark(&mut self, name: impl Into<String>, pixel: [f64; 2]) {
        self.annotations.landmarks.insert(name.into(), pixel);
    }

    /// Drop everything and wait for the first line again.
    pub fn reset(&mut self) {
        self.annotations = ManualAnnotations::default();
        self.state = Self::state_for(0, self.required_lines);
    }

    pub fn finish(self) -> Result<ManualAnnotations, AnnotationError> {
        match self.state {
            AnnotationState::Ready => Ok(self.annotations),
            AnnotationState::AwaitingLine { index } => Err(AnnotationError::NotReady {
                traced: index,
                required: self.required_lines,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(x: f64) -> Vec<[f64; 2]> {
        vec![[x, 0.0], [x + 1.0, 100.0], [x + 1.5, 200.0]]
    }

    #[test]
    fn walks_through_three_lines() {
        let mut s = AnnotationSession::default();
        assert_eq!(s.state(), AnnotationState::AwaitingLine { index: 0 });
        assert_eq!(
            s.submit_line("side_left", batch(10.0)),
            Ok(AnnotationState::AwaitingLine { index: 1 })
        );
        assert_eq!(
            s.submit_unnamed_line(batch(50.0)),
            Ok(AnnotationState::AwaitingLine { index: 2 })
        );
        assert_eq!(s.submit_line("side_right", batch(90.0)), Ok(AnnotationState::Ready));
        s.submit_landmark("house_far", [50.0, 40.0]);

        let ann = s.finish().expect("ready");
        assert!(ann.lines.contains_key("line_1"));
        assert_eq!(ann.landmarks.len(), 1);
    }

    #[test]
    fn rejected_batches_keep_state() {
        let mut s = AnnotationSession::default();
        s.submit_line("center_line", batch(1.0)).expect("first line");
        assert_eq!(
            s.submit_line("tee_far", vec![[1.0, 1.0]]),
            Err(AnnotationError::TooFewPoints {
                line: "tee_far".into(),
                found: 1
            })
        );
        assert_eq!(
            s.submit_line("center_line", batch(2.0)),
            Err(AnnotationError::DuplicateLine("center_line".into()))
        );
        assert_eq!(s.state(), AnnotationState::AwaitingLine { index: 1 });
        assert_eq!(
            s.finish().unwrap_err(),
            AnnotationError::NotReady {
                traced: 1,
                required: 3
            }
        );
    }

    #[test]
    fn reset_starts_over() {
        let mut s = AnnotationSession::new(1);
        assert_eq!(s.submit_line("a", batch(0.0)), Ok(AnnotationState::Ready));
        s.reset();
        assert_eq!(s.state(), AnnotationState::AwaitingLine { index: 0 });
        assert_eq!(s.traced_lines(), 0);
    }
}
