use chrono::{DateTime, Duration, Utc};
use nalgebra::{DMatrix, Normed};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Learned state-space model of the heated zones:
/// `T[k+1] = Ax·T[k] + Au·p[k+1] + Aw·w[k+1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ThermalModel {
    pub ax: Array2<f64>,
    pub au: Array2<f64>,
    pub aw: Array2<f64>,
    pub learned_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq)]
pub enum ThermalModelError {
    #[error("matrix shapes are inconsistent: ax {ax:?}, au {au:?}, aw {aw:?}")]
    ShapeMismatch {
        ax: (usize, usize),
        au: (usize, usize),
        aw: (usize, usize),
    },
    #[error("spectral radius {0} exceeds 1")]
    Unstable(f64),
    #[error("input gain matrix has a negative entry: {0}")]
    NegativeInputGain(f64),
}

/// Numerical slack on the stability bound; Clarabel terminates on
/// tolerances, so row sums can overshoot 1 by a hair.
const STABILITY_TOL: f64 = 1e-6;

impl ThermalModel {
    pub fn zones(&self) -> usize {
        self.ax.nrows()
    }

    pub fn inputs(&self) -> usize {
        self.au.ncols()
    }

    pub fn disturbances(&self) -> usize {
        self.aw.ncols()
    }

    /// Largest eigenvalue magnitude of `Ax`.
    pub fn spectral_radius(&self) -> f64 {
        let n = self.ax.nrows();
        let flat: Vec<f64> = self.ax.iter().copied().collect();
        let matrix = DMatrix::from_row_slice(n, n, &flat);
        matrix
            .complex_eigenvalues()
            .iter()
            .map(|e| e.norm())
            .fold(0.0, f64::max)
    }

    /// Check shape consistency, stability of `Ax`, and nonnegativity of `Au`
    /// (heating inputs cannot cool).
    pub fn validate(&self) -> Result<(), ThermalModelError> {
        let zones = self.ax.nrows();
        if self.ax.ncols() != zones || self.au.nrows() != zones || self.aw.nrows() != zones {
            return Err(ThermalModelError::ShapeMismatch {
                ax: self.ax.dim(),
                au: self.au.dim(),
                aw: self.aw.dim(),
            });
        }
        if let Some(&value) = self.au.iter().find(|v| **v < -STABILITY_TOL) {
            return Err(ThermalModelError::NegativeInputGain(value));
        }
        let radius = self.spectral_radius();
        if radius > 1.0 + STABILITY_TOL {
            return Err(ThermalModelError::Unstable(radius));
        }
        Ok(())
    }

    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.learned_at <= ttl
    }

    /// Conservative stand-in used when learning fails and no previous
    /// artifact exists: slow diagonal decay, weak uniform heater gain, no
    /// weather coupling.
    pub fn fallback(zones: usize, inputs: usize, disturbances: usize, now: DateTime<Utc>) -> Self {
        Self {
            ax: Array2::from_diag_elem(zones, 0.95),
            au: Array2::from_elem((zones, inputs), 0.1),
            aw: Array2::zeros((zones, disturbances)),
            learned_at: now,
        }
    }
}

/// On-disk artifact shape (`THERMAL_MODEL_PATH`). Matrices are row-major
/// nested arrays so the file stays readable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermalModelArtifact {
    pub ax: Vec<Vec<f64>>,
    pub au: Vec<Vec<f64>>,
    pub aw: Vec<Vec<f64>>,
    pub learned_at: DateTime<Utc>,
}

fn to_rows(matrix: &Array2<f64>) -> Vec<Vec<f64>> {
    matrix.rows().into_iter().map(|row| row.to_vec()).collect()
}

fn from_rows(rows: &[Vec<f64>], what: &str) -> Result<Array2<f64>, String> {
    let nrows = rows.len();
    let ncols = rows.first().map(Vec::len).unwrap_or(0);
    if rows.iter().any(|row| row.len() != ncols) {
        return Err(format!("{what} rows are ragged"));
    }
    let flat: Vec<f64> = rows.iter().flatten().copied().collect();
    Array2::from_shape_vec((nrows, ncols), flat).map_err(|e| format!("{what}: {e}"))
}

impl From<&ThermalModel> for ThermalModelArtifact {
    fn from(model: &ThermalModel) -> Self {
        Self {
            ax: to_rows(&model.ax),
            au: to_rows(&model.au),
            aw: to_rows(&model.aw),
            learned_at: model.learned_at,
        }
    }
}

impl TryFrom<ThermalModelArtifact> for ThermalModel {
    type Error = String;

    fn try_from(artifact: ThermalModelArtifact) -> Result<Self, String> {
        Ok(Self {
            ax: from_rows(&artifact.ax, "ax")?,
            au: from_rows(&artifact.au, "au")?,
            aw: from_rows(&artifact.aw, "aw")?,
            learned_at: artifact.learned_at,
        })
    }
}
