/// Errors raised while building or addressing labware.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LabwareError {
    /// A well was described with inconsistent geometry.
    #[error("invalid well: {0}")]
    InvalidWell(String),

    /// The cylinder strategy needs a bottom depth and a diameter.
    #[error("cylinder strategy requires both dip_btm and diameter")]
    CylinderRequiresGeometry,

    /// A plate was described with an invalid grid.
    #[error("invalid plate: {0}")]
    InvalidPlate(String),

    /// The plate type name is not one of the known kinds.
    #[error("unknown plate type '{0}' (expected array, singleton, tipbox or waste_container)")]
    UnknownPlateType(String),

    /// The dip strategy name is not one of the known strategies.
    #[error("unknown dip strategy '{0}' (expected simple or cylinder)")]
    UnknownStrategy(String),

    /// Row/column addressing outside of the plate grid.
    #[error("well ({row}, {col}) is outside the {rows}x{cols} plate")]
    OutOfRange {
        row: usize,
        col: usize,
        rows: usize,
        cols: usize,
    },

    /// Only tip boxes can be pooled together.
    #[error("cannot pool a {0} plate as a tip box")]
    NotATipBox(&'static str),

    /// Calibration data cannot produce a quadratic fit.
    #[error("invalid calibration: {0}")]
    Calibration(String),
}

pub type Result<T> = std::result::Result<T, LabwareError>;
