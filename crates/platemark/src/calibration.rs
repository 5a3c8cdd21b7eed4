//! Calibration record consumed by the engine.
//!
//! Produced externally (calibration CLI); the engine checks numeric validity
//! only, never provenance.

use std::path::Path;

use crate::config::validate_homography_cells;

/// Camera-to-plate calibration: a rectifying homography plus the scalar
/// scale of the rectified frame.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CalibrationData {
    /// Raw camera pixels → rectified plate pixels, row-major.
    pub homography: [[f64; 3]; 3],
    /// Millimetres per rectified pixel.
    pub mm_per_px: f64,
}

/// Calibration file rejected on numeric grounds.
#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    #[error("cannot read calibration: {0}")]
    Unreadable(String),
    #[error("calibration homography invalid: {0}")]
    BadHomography(String),
    #[error("calibration mm_per_px invalid: {0}")]
    BadScale(f64),
}

impl CalibrationData {
    /// Check finiteness and invertibility. Does not judge plausibility.
    pub fn validate(&self) -> Result<(), CalibrationError> {
        validate_homography_cells(&self.homography).map_err(CalibrationError::BadHomography)?;
        if !(self.mm_per_px > 0.0 && self.mm_per_px.is_finite()) {
            return Err(CalibrationError::BadScale(self.mm_per_px));
        }
        Ok(())
    }

    /// Load and validate a calibration JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self, CalibrationError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| CalibrationError::Unreadable(format!("{}: {e}", path.display())))?;
        let cal: Self =
            serde_json::from_str(&data).map_err(|e| CalibrationError::Unreadable(e.to_string()))?;
        cal.validate()?;
        Ok(cal)
    }
}
