//! JSON persistence for calibration records, configuration and annotations.

use crate::calibrate::CalibrationResult;
use crate::detect::ManualAnnotations;
use crate::params::CalibrationConfig;
use serde::{de::DeserializeOwned, Serialize};
use std::{fs, path::Path};

#[derive(thiserror::Error, Debug)]
pub enum CalibrationIoError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Read any JSON document from disk.
pub fn load_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, CalibrationIoError> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Write `value` to disk as pretty JSON.
pub fn write_json<T: Serialize>(value: &T, path: impl AsRef<Path>) -> Result<(), CalibrationIoError> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json)?;
    Ok(())
}

pub fn save_calibration(
    result: &CalibrationResult,
    path: impl AsRef<Path>,
) -> Result<(), CalibrationIoError> {
    write_json(result, path)
}

pub fn load_calibration(path: impl AsRef<Path>) -> Result<CalibrationResult, CalibrationIoError> {
    load_json(path)
}

impl CalibrationConfig {
    /// Load a JSON config from disk; missing fields take their defaults.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, CalibrationIoError> {
        load_json(path)
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), CalibrationIoError> {
        write_json(self, path)
    }
}

impl ManualAnnotations {
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, CalibrationIoError> {
        load_json(path)
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), CalibrationIoError> {
        write_json(self, path)
    }
}
