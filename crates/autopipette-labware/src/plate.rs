use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::coordinate::Coordinate;
use crate::error::{LabwareError, Result};
use crate::well::{DipStrategy, Well};

/// What a plate is used for on the deck.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlateKind {
    /// A grid of sample wells.
    Array,
    /// A single vessel; always 1x1.
    Singleton,
    /// A grid of disposable tips.
    #[serde(rename = "tipbox", alias = "tip_box")]
    TipBox,
    /// Where tips and discarded liquid go; always 1x1.
    WasteContainer,
}

impl PlateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Array => "array",
            Self::Singleton => "singleton",
            Self::TipBox => "tipbox",
            Self::WasteContainer => "waste_container",
        }
    }

    /// Singleton kinds ignore the requested grid size.
    pub fn is_singleton(&self) -> bool {
        matches!(self, Self::Singleton | Self::WasteContainer)
    }
}

impl fmt::Display for PlateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlateKind {
    type Err = LabwareError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "array" => Ok(Self::Array),
            "singleton" => Ok(Self::Singleton),
            "tipbox" | "tip_box" => Ok(Self::TipBox),
            "waste_container" | "waste" => Ok(Self::WasteContainer),
            other => Err(LabwareError::UnknownPlateType(other.to_string())),
        }
    }
}

/// Declarative plate description, as read from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateSpec {
    #[serde(rename = "type")]
    pub kind: PlateKind,
    #[serde(default = "one")]
    pub rows: usize,
    #[serde(default = "one")]
    pub cols: usize,
    #[serde(default)]
    pub spacing_row: f64,
    #[serde(default)]
    pub spacing_col: f64,
    pub dip_top: f64,
    #[serde(default)]
    pub dip_btm: Option<f64>,
    #[serde(default)]
    pub diameter: Option<f64>,
    #[serde(default)]
    pub strategy: DipStrategy,
}

fn one() -> usize {
    1
}

impl PlateSpec {
    /// Materialize the plate with its first well at `origin`.
    pub fn build(&self, origin: Coordinate) -> Result<Plate> {
        let template = Well::new(
            origin,
            self.dip_top,
            self.dip_btm,
            self.diameter,
            self.strategy,
        )?;
        Plate::new(
            self.kind,
            &template,
            self.rows,
            self.cols,
            self.spacing_row,
            self.spacing_col,
        )
    }
}

/// An ordered grid of independent wells with a round-robin cursor.
///
/// Well `(row, col)` sits at `x0 - col * spacing_col`, `y0 + row * spacing_row`
/// and has index `col + cols * row`.
#[derive(Debug, Clone, PartialEq)]
pub struct Plate {
    kind: PlateKind,
    rows: usize,
    cols: usize,
    spacing_row: f64,
    spacing_col: f64,
    wells: Vec<Well>,
    cursor: usize,
}

impl Plate {
    pub fn new(
        kind: PlateKind,
        template: &Well,
        rows: usize,
        cols: usize,
        spacing_row: f64,
        spacing_col: f64,
    ) -> Result<Self> {
        let (rows, cols) = if kind.is_singleton() { (1, 1) } else { (rows, cols) };
        if rows == 0 || cols == 0 {
            return Err(LabwareError::InvalidPlate(format!(
                "{kind} plate needs at least one row and column, got {rows}x{cols}"
            )));
        }
        if !spacing_row.is_finite() || !spacing_col.is_finite() {
            return Err(LabwareError::InvalidPlate(
                "well spacing must be finite".to_string(),
            ));
        }

        let origin = template.coordinate();
        let mut wells = Vec::with_capacity(rows * cols);
        for row in 0..rows {
            for col in 0..cols {
                let at = origin.offset(
                    -(col as f64) * spacing_col,
                    row as f64 * spacing_row,
                    0.0,
                );
                wells.push(template.relocated(at));
            }
        }

        Ok(Self {
            kind,
            rows,
            cols,
            spacing_row,
            spacing_col,
            wells,
            cursor: 0,
        })
    }

    pub fn kind(&self) -> PlateKind {
        self.kind
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn spacing(&self) -> (f64, f64) {
        (self.spacing_row, self.spacing_col)
    }

    pub fn len(&self) -> usize {
        self.wells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wells.is_empty()
    }

    /// Index the next call to [`Plate::next`] will use.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Advance the cursor and return the index of the well it pointed at.
    pub fn next_index(&mut self) -> usize {
        let idx = self.cursor;
        self.cursor = (self.cursor + 1) % self.wells.len();
        idx
    }

    /// Move the cursor to `idx`; an index past the end wraps to the first well.
    pub fn seek(&mut self, idx: usize) {
        self.cursor = if idx < self.wells.len() { idx } else { 0 };
    }

    /// Coordinate of the next well in round-robin order.
    pub fn next(&mut self) -> Coordinate {
        let idx = self.next_index();
        self.wells[idx].coordinate()
    }

    /// Index of the well at `(row, col)`.
    pub fn index_of(&self, row: usize, col: usize) -> Result<usize> {
        let idx = col + self.cols * row;
        if row >= self.rows || col >= self.cols || idx >= self.wells.len() {
            return Err(LabwareError::OutOfRange {
                row,
                col,
                rows: self.rows,
                cols: self.cols,
            });
        }
        Ok(idx)
    }

    /// Coordinate of the well at `(row, col)`; does not move the cursor.
    pub fn get(&self, row: usize, col: usize) -> Result<Coordinate> {
        let idx = self.index_of(row, col)?;
        Ok(self.wells[idx].coordinate())
    }

    pub fn well(&self, idx: usize) -> Option<&Well> {
        self.wells.get(idx)
    }

    pub fn well_mut(&mut self, idx: usize) -> Option<&mut Well> {
        self.wells.get_mut(idx)
    }

    pub fn wells(&self) -> &[Well] {
        &self.wells
    }

    /// Rewind the cursor and restore every well to its top dip depth.
    pub fn reset(&mut self) {
        self.cursor = 0;
        for well in &mut self.wells {
            well.reset_dip();
        }
    }

    /// Append deep copies of `other`'s wells after this plate's wells.
    ///
    /// Both plates must be tip boxes. The grid keeps this plate's column count
    /// and grows its row count to cover the merged list.
    pub fn absorb(&mut self, other: &Plate) -> Result<()> {
        if self.kind != PlateKind::TipBox {
            return Err(LabwareError::NotATipBox(self.kind.as_str()));
        }
        if other.kind != PlateKind::TipBox {
            return Err(LabwareError::NotATipBox(other.kind.as_str()));
        }
        self.wells.extend(other.wells.iter().cloned());
        self.rows = self.wells.len().div_ceil(self.cols);
        debug!(wells = self.wells.len(), rows = self.rows, "tip box absorbed");
        Ok(())
    }
}
