use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::coordinate::Coordinate;
use crate::error::{LabwareError, Result};

/// How far a tip must descend into a well as a function of volume moved.
///
/// Depths are absolute z targets: larger values reach deeper into the well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DipStrategy {
    /// Constant depth at `dip_top`.
    #[default]
    Simple,
    /// Liquid surface of a circular vessel; the depth follows the volume.
    Cylinder,
}

impl DipStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Cylinder => "cylinder",
        }
    }
}

impl fmt::Display for DipStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DipStrategy {
    type Err = LabwareError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simple" => Ok(Self::Simple),
            "cylinder" => Ok(Self::Cylinder),
            other => Err(LabwareError::UnknownStrategy(other.to_string())),
        }
    }
}

/// A vessel at a fixed coordinate, tracking its current liquid-surface depth.
#[derive(Debug, Clone, PartialEq)]
pub struct Well {
    coordinate: Coordinate,
    dip_top: f64,
    dip_btm: Option<f64>,
    diameter: Option<f64>,
    strategy: DipStrategy,
    dip_curr: f64,
}

impl Well {
    /// A well using the simple strategy.
    pub fn simple(coordinate: Coordinate, dip_top: f64) -> Result<Self> {
        Self::new(coordinate, dip_top, None, None, DipStrategy::Simple)
    }

    /// A well using the cylinder strategy.
    pub fn cylinder(coordinate: Coordinate, dip_top: f64, dip_btm: f64, diameter: f64) -> Result<Self> {
        Self::new(
            coordinate,
            dip_top,
            Some(dip_btm),
            Some(diameter),
            DipStrategy::Cylinder,
        )
    }

    /// Build a well, validating the geometry against the strategy.
    pub fn new(
        coordinate: Coordinate,
        dip_top: f64,
        dip_btm: Option<f64>,
        diameter: Option<f64>,
        strategy: DipStrategy,
    ) -> Result<Self> {
        if !coordinate.is_finite() {
            return Err(LabwareError::InvalidWell(format!(
                "coordinate {coordinate} is not finite"
            )));
        }
        if !dip_top.is_finite() || dip_top < 0.0 {
            return Err(LabwareError::InvalidWell(format!(
                "dip_top must be a non-negative number, got {dip_top}"
            )));
        }
        if let Some(btm) = dip_btm {
            if !btm.is_finite() || btm < dip_top {
                return Err(LabwareError::InvalidWell(format!(
                    "dip_btm ({btm}) must not be above dip_top ({dip_top})"
                )));
            }
        }
        if let Some(d) = diameter {
            if !d.is_finite() || d <= 0.0 {
                return Err(LabwareError::InvalidWell(format!(
                    "diameter must be positive, got {d}"
                )));
            }
        }
        if strategy == DipStrategy::Cylinder && (dip_btm.is_none() || diameter.is_none()) {
            return Err(LabwareError::CylinderRequiresGeometry);
        }

        Ok(Self {
            coordinate,
            dip_top,
            dip_btm,
            diameter,
            strategy,
            dip_curr: dip_top,
        })
    }

    /// Copy this well's dip model to another coordinate, starting full.
    pub fn relocated(&self, coordinate: Coordinate) -> Self {
        Self {
            coordinate,
            dip_curr: self.dip_top,
            ..self.clone()
        }
    }

    pub fn coordinate(&self) -> Coordinate {
        self.coordinate
    }

    pub fn dip_top(&self) -> f64 {
        self.dip_top
    }

    pub fn dip_btm(&self) -> Option<f64> {
        self.dip_btm
    }

    pub fn diameter(&self) -> Option<f64> {
        self.diameter
    }

    pub fn strategy(&self) -> DipStrategy {
        self.strategy
    }

    /// Current liquid-surface depth.
    pub fn dip_curr(&self) -> f64 {
        self.dip_curr
    }

    /// Depth to reach before withdrawing `volume` microliters.
    ///
    /// The cylinder strategy lowers the tracked surface by the height of the
    /// withdrawn column and never goes past `dip_btm`.
    pub fn get_dip_distance(&mut self, volume: f64) -> f64 {
        match self.strategy {
            DipStrategy::Simple => self.dip_top,
            DipStrategy::Cylinder => {
                self.dip_curr += self.column_height(volume);
                if let Some(btm) = self.dip_btm {
                    if self.dip_curr > btm {
                        self.dip_curr = btm;
                    }
                }
                self.dip_curr
            }
        }
    }

    /// Depth to reach when adding `volume` microliters.
    ///
    /// The tip goes to the current surface, then the tracked surface rises by
    /// the added column, bounded by `dip_top`.
    pub fn dispense_dip_distance(&mut self, volume: f64) -> f64 {
        match self.strategy {
            DipStrategy::Simple => self.dip_top,
            DipStrategy::Cylinder => {
                let depth = self.dip_curr;
                self.dip_curr = (self.dip_curr - self.column_height(volume)).max(self.dip_top);
                depth
            }
        }
    }

    /// Forget withdrawals and start at the top again.
    pub fn reset_dip(&mut self) {
        self.dip_curr = self.dip_top;
    }

    /// Height in mm of `volume` µL in this well's cross-section (1 µL = 1 mm³).
    fn column_height(&self, volume: f64) -> f64 {
        match self.diameter {
            Some(d) if volume > 0.0 => {
                let radius = d / 2.0;
                volume / (PI * radius * radius)
            }
            _ => 0.0,
        }
    }
}
