use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::error::{LabwareError, Result};

/// Singular values below this count as zero when fitting.
const RANK_EPSILON: f64 = 1e-12;

/// Factory calibration pairs `(volume µL, plunger steps)`.
pub const DEFAULT_CALIBRATION: [(f64, f64); 7] = [
    (0.0, 0.0),
    (25.0, 14.35),
    (50.0, 22.45),
    (100.0, 39.25),
    (200.0, 78.50),
    (300.0, 117.75),
    (400.0, 157.00),
];

/// Quadratic fit `steps = a + b*v + c*v^2` over calibration pairs.
///
/// Outside the calibrated domain the curve is extrapolated.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeConverter {
    coeffs: [f64; 3],
    domain: (f64, f64),
    max_residual: f64,
}

impl VolumeConverter {
    /// Fit the curve by least squares.
    ///
    /// Requires equally sized inputs with at least three distinct volumes, and
    /// the resulting curve must be monotonic over the calibrated range.
    pub fn new(volumes: &[f64], steps: &[f64]) -> Result<Self> {
        if volumes.len() != steps.len() {
            return Err(LabwareError::Calibration(format!(
                "{} volumes but {} step values",
                volumes.len(),
                steps.len()
            )));
        }
        if volumes.iter().chain(steps).any(|v| !v.is_finite()) {
            return Err(LabwareError::Calibration(
                "calibration values must be finite".to_string(),
            ));
        }
        let mut distinct: Vec<f64> = volumes.to_vec();
        distinct.sort_by(f64::total_cmp);
        distinct.dedup();
        if distinct.len() < 3 {
            return Err(LabwareError::Calibration(
                "at least three distinct volumes are required".to_string(),
            ));
        }
        let lo = distinct[0];
        let hi = distinct[distinct.len() - 1];

        // Fit in scaled units so the Vandermonde columns stay comparable.
        let scale = lo.abs().max(hi.abs());
        let design = DMatrix::from_fn(volumes.len(), 3, |row, col| {
            (volumes[row] / scale).powi(col as i32)
        });
        let target = DVector::from_column_slice(steps);
        let svd = design.svd(true, true);
        if svd.rank(RANK_EPSILON) < 3 {
            return Err(LabwareError::Calibration(
                "calibration points do not determine a curve".to_string(),
            ));
        }
        let scaled = svd.solve(&target, RANK_EPSILON).map_err(|reason| {
            LabwareError::Calibration(format!("least-squares fit failed: {reason}"))
        })?;
        let coeffs = [scaled[0], scaled[1] / scale, scaled[2] / (scale * scale)];

        let mut converter = Self {
            coeffs,
            domain: (lo, hi),
            max_residual: 0.0,
        };
        converter.max_residual = volumes
            .iter()
            .zip(steps)
            .map(|(&v, &s)| (converter.vol_to_steps(v) - s).abs())
            .fold(0.0, f64::max);

        if !converter.is_monotonic() {
            return Err(LabwareError::Calibration(
                "fitted curve is not monotonic over the calibrated range".to_string(),
            ));
        }
        debug!(
            a = coeffs[0],
            b = coeffs[1],
            c = coeffs[2],
            max_residual = converter.max_residual,
            "volume calibration fitted"
        );
        Ok(converter)
    }

    /// Fit from `(volume, steps)` pairs.
    pub fn from_pairs(pairs: &[(f64, f64)]) -> Result<Self> {
        let (volumes, steps): (Vec<f64>, Vec<f64>) = pairs.iter().copied().unzip();
        Self::new(&volumes, &steps)
    }

    /// Plunger steps for `volume` microliters.
    pub fn vol_to_steps(&self, volume: f64) -> f64 {
        let [a, b, c] = self.coeffs;
        a + volume * (b + volume * c)
    }

    /// Inverse of [`VolumeConverter::vol_to_steps`].
    ///
    /// Picks the root nearest the calibrated domain.
    pub fn steps_to_vol(&self, steps: f64) -> Result<f64> {
        let [a, b, c] = self.coeffs;
        let a = a - steps;
        if c.abs() < 1e-12 {
            if b.abs() < 1e-12 {
                return Err(LabwareError::Calibration("curve is flat".to_string()));
            }
            return Ok(-a / b);
        }
        let disc = b * b - 4.0 * c * a;
        if disc < 0.0 {
            return Err(LabwareError::Calibration(format!(
                "no volume maps to {steps} steps"
            )));
        }
        let sq = disc.sqrt();
        let r1 = (-b + sq) / (2.0 * c);
        let r2 = (-b - sq) / (2.0 * c);
        let (lo, hi) = self.domain;
        let distance = |r: f64| {
            if r < lo {
                lo - r
            } else if r > hi {
                r - hi
            } else {
                0.0
            }
        };
        Ok(if distance(r1) <= distance(r2) { r1 } else { r2 })
    }

    /// True when the slope keeps one sign over the calibrated domain.
    pub fn is_monotonic(&self) -> bool {
        let [_, b, c] = self.coeffs;
        let (lo, hi) = self.domain;
        let d_lo = b + 2.0 * c * lo;
        let d_hi = b + 2.0 * c * hi;
        (d_lo > 0.0 && d_hi > 0.0) || (d_lo < 0.0 && d_hi < 0.0)
    }

    /// `[a, b, c]` of `a + b*v + c*v^2`.
    pub fn coefficients(&self) -> [f64; 3] {
        self.coeffs
    }

    /// Calibrated `(min, max)` volume.
    pub fn domain(&self) -> (f64, f64) {
        self.domain
    }

    /// Largest absolute fit error over the calibration points.
    pub fn max_residual(&self) -> f64 {
        self.max_residual
    }
}

impl Default for VolumeConverter {
    fn default() -> Self {
        // The factory table is known good; fall back to a linear curve only
        // if that ever changes.
        Self::from_pairs(&DEFAULT_CALIBRATION).unwrap_or(Self {
            coeffs: [0.0, 0.3925, 0.0],
            domain: (0.0, 400.0),
            max_residual: 0.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_quadratic_is_reproduced() {
        let f = |v: f64| 2.0 + 0.5 * v + 0.001 * v * v;
        let volumes = [0.0, 10.0, 50.0, 120.0, 200.0];
        let steps: Vec<f64> = volumes.iter().map(|&v| f(v)).collect();
        let conv = VolumeConverter::new(&volumes, &steps).expect("fit should succeed");
        for &v in &volumes {
            assert!((conv.vol_to_steps(v) - f(v)).abs() < 1e-6);
        }
        assert!(conv.max_residual() < 1e-6);
    }

    #[test]
    fn default_calibration_fits_within_residual_and_is_monotonic() {
        let conv = VolumeConverter::default();
        assert!(conv.is_monotonic());
        for (v, s) in DEFAULT_CALIBRATION {
            assert!((conv.vol_to_steps(v) - s).abs() <= conv.max_residual() + 1e-9);
        }
        let mut prev = conv.vol_to_steps(0.0);
        for v in (5..=400).step_by(5) {
            let cur = conv.vol_to_steps(v as f64);
            assert!(cur > prev, "curve must increase at {v}");
            prev = cur;
        }
    }

    #[test]
    fn inverse_round_trips_inside_domain() {
        let conv = VolumeConverter::default();
        for v in [0.0, 12.5, 99.0, 250.0, 400.0] {
            let back = conv.steps_to_vol(conv.vol_to_steps(v)).expect("inverse exists");
            assert!((back - v).abs() < 1e-6, "{v} -> {back}");
        }
    }

    #[test]
    fn rejects_too_few_points() {
        let err = VolumeConverter::new(&[0.0, 10.0, 10.0], &[0.0, 1.0, 1.0])
            .expect_err("two distinct volumes cannot define a quadratic");
        assert!(matches!(err, LabwareError::Calibration(_)));
    }

    #[test]
    fn overdetermined_fit_minimizes_squared_error() {
        let volumes = [0.0, 100.0, 200.0, 300.0, 400.0];
        let steps = [1.0, 39.0, 81.0, 119.0, 161.0];
        let conv = VolumeConverter::new(&volumes, &steps).expect("fit should succeed");
        // Closed-form normal-equation solution for these five points.
        let [a, b, c] = conv.coefficients();
        assert!((a - 27.0 / 35.0).abs() < 1e-9, "intercept {a}");
        assert!((b - 1.36 / 3.5).abs() < 1e-9, "slope {b}");
        assert!((c - 1.0 / 35_000.0).abs() < 1e-12, "curvature {c}");
        assert!((conv.max_residual() - 48.0 / 35.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_mismatched_lengths() {
        assert!(VolumeConverter::new(&[0.0, 1.0, 2.0], &[0.0, 1.0]).is_err());
    }

    #[test]
    fn rejects_non_monotonic_curve() {
        let err = VolumeConverter::new(&[0.0, 50.0, 100.0], &[0.0, 10.0, 0.0])
            .expect_err("hump is not monotonic");
        assert!(matches!(err, LabwareError::Calibration(_)));
    }

    #[test]
    fn extrapolates_outside_domain() {
        let conv = VolumeConverter::default();
        assert!(conv.vol_to_steps(500.0) > conv.vol_to_steps(400.0));
    }
}
