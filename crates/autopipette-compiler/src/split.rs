use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CompilerError, Result};

/// One leg of a multi-destination dispense.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Split {
    pub destination: String,
    pub volume: f64,
    #[serde(default)]
    pub row: Option<usize>,
    #[serde(default)]
    pub col: Option<usize>,
}

impl Split {
    pub fn new(destination: impl Into<String>, volume: f64) -> Self {
        Self {
            destination: destination.into(),
            volume,
            row: None,
            col: None,
        }
    }

    pub fn at(mut self, row: usize, col: usize) -> Self {
        self.row = Some(row);
        self.col = Some(col);
        self
    }
}

/// Parse `DEST:VOL[@ROW,COL];DEST2:VOL2...`.
///
/// Empty segments are skipped; an entirely empty list is an error.
pub fn parse_splits(text: &str) -> Result<Vec<Split>> {
    let mut splits = Vec::new();
    for segment in text.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let (dest, rest) = segment.split_once(':').ok_or_else(|| {
            CompilerError::Validation(format!("split '{segment}' must look like DEST:VOL"))
        })?;
        let dest = dest.trim();
        if dest.is_empty() {
            return Err(CompilerError::Validation(format!(
                "split '{segment}' has no destination"
            )));
        }
        let (vol_text, addr) = match rest.split_once('@') {
            Some((v, a)) => (v, Some(a)),
            None => (rest, None),
        };
        let volume: f64 = vol_text.trim().parse().map_err(|_| {
            CompilerError::Validation(format!("split '{segment}' has a non-numeric volume"))
        })?;
        if !volume.is_finite() || volume < 0.0 {
            return Err(CompilerError::InvalidVolume(volume));
        }

        let mut split = Split::new(dest, volume);
        if let Some(addr) = addr {
            let (row, col) = addr.split_once(',').ok_or_else(|| {
                CompilerError::Validation(format!("split '{segment}' needs @ROW,COL"))
            })?;
            let parse = |t: &str| {
                t.trim().parse::<usize>().map_err(|_| {
                    CompilerError::Validation(format!(
                        "split '{segment}' has an invalid well index '{}'",
                        t.trim()
                    ))
                })
            };
            split = split.at(parse(row)?, parse(col)?);
        }
        splits.push(split);
    }
    if splits.is_empty() {
        return Err(CompilerError::Validation("no splits given".to_string()));
    }
    Ok(splits)
}

/// What to do with aspirated liquid that no split claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeftoverPolicy {
    /// Keep it in the tip; the tip stays on.
    Keep,
    /// Expel it into the waste container.
    #[default]
    Waste,
    /// Return it to where it was drawn from.
    Source,
}

impl fmt::Display for LeftoverPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Keep => "keep",
            Self::Waste => "waste",
            Self::Source => "source",
        })
    }
}

impl FromStr for LeftoverPolicy {
    type Err = CompilerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keep" => Ok(Self::Keep),
            "waste" => Ok(Self::Waste),
            "source" => Ok(Self::Source),
            other => Err(CompilerError::Validation(format!(
                "unknown leftover policy '{other}' (expected keep, waste or source)"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_addressed_legs() {
        let splits = parse_splits("plate:20@0,1; tube:15 ;").expect("splits should parse");
        assert_eq!(
            splits,
            vec![Split::new("plate", 20.0).at(0, 1), Split::new("tube", 15.0)]
        );
    }

    #[test]
    fn rejects_malformed_legs() {
        assert!(parse_splits("plate20").is_err());
        assert!(parse_splits(":20").is_err());
        assert!(parse_splits("plate:abc").is_err());
        assert!(parse_splits("plate:10@1").is_err());
        assert!(parse_splits("plate:10@a,1").is_err());
        assert!(parse_splits(" ; ").is_err());
    }

    #[test]
    fn rejects_negative_volume() {
        assert_eq!(
            parse_splits("plate:-5"),
            Err(CompilerError::InvalidVolume(-5.0))
        );
    }

    #[test]
    fn leftover_policy_parses() {
        assert_eq!("KEEP".parse::<LeftoverPolicy>(), Ok(LeftoverPolicy::Keep));
        assert_eq!(LeftoverPolicy::default(), LeftoverPolicy::Waste);
        assert!("drain".parse::<LeftoverPolicy>().is_err());
    }
}
