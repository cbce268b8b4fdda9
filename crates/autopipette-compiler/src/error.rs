use autopipette_labware::LabwareError;

/// Broad classes of compiler failures, used by callers to decide how to
/// report a rejected command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or out-of-range arguments.
    Validation,
    /// A required deck resource (tip source, waste) is missing.
    ResourceNotConfigured,
    /// A location name does not resolve.
    Location,
    /// The request conflicts with the tracked machine state.
    StateConflict,
}

/// Errors from compiling pipetting operations.
///
/// Every error is raised before any instruction is kept in the buffer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompilerError {
    /// A volume was negative or not a number.
    #[error("invalid volume {0}: volumes must be non-negative numbers")]
    InvalidVolume(f64),

    /// Arguments were malformed or out of range.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Pipette parameters failed validation.
    #[error("invalid pipette parameters: {0}")]
    InvalidParams(String),

    /// No tip box is registered or pinned.
    #[error("no tip box is configured")]
    NoTipbox,

    /// No waste container is registered.
    #[error("no waste container is configured")]
    NoWasteContainer,

    /// The name is not a registered location.
    #[error("'{0}' is not a known location")]
    NotALocation(String),

    /// The name is registered but is not a tip box.
    #[error("'{0}' is not a tip box")]
    NotATipBox(String),

    /// A tip is already attached.
    #[error("a tip is already attached")]
    TipAlreadyOn,

    /// The operation needs a tip and none is attached.
    #[error("no tip is attached")]
    NoTip,

    /// The tip still holds liquid from an earlier aspirate.
    #[error("the tip still holds liquid")]
    LiquidInTip,

    /// The operation needs liquid in the tip and there is none.
    #[error("the tip holds no liquid")]
    NoLiquid,

    /// A labware lookup or construction failed.
    #[error(transparent)]
    Labware(#[from] LabwareError),
}

impl CompilerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidVolume(_) | Self::Validation(_) | Self::InvalidParams(_) => {
                ErrorKind::Validation
            }
            Self::NoTipbox | Self::NoWasteContainer => ErrorKind::ResourceNotConfigured,
            Self::NotALocation(_) | Self::NotATipBox(_) => ErrorKind::Location,
            Self::TipAlreadyOn | Self::NoTip | Self::LiquidInTip | Self::NoLiquid => {
                ErrorKind::StateConflict
            }
            Self::Labware(_) => ErrorKind::Validation,
        }
    }
}

pub type Result<T> = std::result::Result<T, CompilerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_group_errors() {
        assert_eq!(CompilerError::InvalidVolume(-1.0).kind(), ErrorKind::Validation);
        assert_eq!(CompilerError::NoTipbox.kind(), ErrorKind::ResourceNotConfigured);
        assert_eq!(
            CompilerError::NotALocation("plate".into()).kind(),
            ErrorKind::Location
        );
        assert_eq!(CompilerError::TipAlreadyOn.kind(), ErrorKind::StateConflict);
        let oob = LabwareError::OutOfRange { row: 9, col: 0, rows: 8, cols: 12 };
        assert_eq!(CompilerError::from(oob).kind(), ErrorKind::Validation);
    }

    #[test]
    fn labware_errors_display_transparently() {
        let err = CompilerError::from(LabwareError::CylinderRequiresGeometry);
        assert_eq!(
            err.to_string(),
            "cylinder strategy requires both dip_btm and diameter"
        );
    }
}
