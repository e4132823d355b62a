//! Lens distortion model and its plumb-line fit.

mod model;
mod solver;

pub use model::{optimal_camera_matrix, CameraMatrix, DistortionCoefficients, DistortionModel};
pub use solver::{DistortionFit, DistortionFitConfig, DistortionMode, DistortionSolver};
