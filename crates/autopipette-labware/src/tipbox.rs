use tracing::debug;

use crate::error::{LabwareError, Result};
use crate::plate::{Plate, PlateKind};

/// Merges every registered tip box into one pooled tip source.
///
/// The pool owns deep copies: consuming tips from the pooled view never
/// touches the boxes held in the location registry, and vice versa. A box
/// can be pinned as active to bypass the pool entirely.
#[derive(Debug, Clone, Default)]
pub struct TipPool {
    members: Vec<(String, Plate)>,
    pooled: Option<Plate>,
    active: Option<String>,
}

impl TipPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a tip box.
    ///
    /// A new box is appended to the pooled view without moving its cursor,
    /// so tips already handed out stay consumed. Replacing a box rebuilds
    /// the view.
    pub fn register(&mut self, name: &str, plate: &Plate) -> Result<()> {
        if plate.kind() != PlateKind::TipBox {
            return Err(LabwareError::NotATipBox(plate.kind().as_str()));
        }
        if let Some((_, existing)) = self.members.iter_mut().find(|(n, _)| n == name) {
            *existing = plate.clone();
            return self.rebuild();
        }
        self.members.push((name.to_string(), plate.clone()));
        match self.pooled.as_mut() {
            Some(pooled) => {
                pooled.absorb(plate)?;
                debug!(
                    boxes = self.members.len(),
                    tips = pooled.len(),
                    cursor = pooled.cursor(),
                    "tip box pooled"
                );
            }
            None => {
                let mut pooled = plate.clone();
                pooled.reset();
                self.pooled = Some(pooled);
            }
        }
        Ok(())
    }

    /// Drop a tip box from the pool. Unknown names are ignored.
    pub fn unregister(&mut self, name: &str) -> Result<()> {
        let before = self.members.len();
        self.members.retain(|(n, _)| n != name);
        if self.active.as_deref() == Some(name) {
            self.active = None;
        }
        if self.members.len() != before {
            self.rebuild()?;
        }
        Ok(())
    }

    /// Re-merge the members, keeping the pooled cursor where it was.
    fn rebuild(&mut self) -> Result<()> {
        let cursor = self.pooled.as_ref().map_or(0, Plate::cursor);
        let mut iter = self.members.iter();
        let Some((_, first)) = iter.next() else {
            self.pooled = None;
            return Ok(());
        };
        let mut pooled = first.clone();
        pooled.reset();
        for (_, plate) in iter {
            pooled.absorb(plate)?;
        }
        pooled.seek(cursor);
        debug!(
            boxes = self.members.len(),
            tips = pooled.len(),
            cursor = pooled.cursor(),
            "tip pool rebuilt"
        );
        self.pooled = Some(pooled);
        Ok(())
    }

    /// Rewind the pooled view so tips are handed out from the start again.
    pub fn refill(&mut self) {
        if let Some(pooled) = self.pooled.as_mut() {
            pooled.reset();
        }
    }

    /// Pin a named box as the default tip source, or clear the pin.
    pub fn pin(&mut self, name: Option<String>) {
        self.active = name;
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn pooled(&self) -> Option<&Plate> {
        self.pooled.as_ref()
    }

    pub fn pooled_mut(&mut self) -> Option<&mut Plate> {
        self.pooled.as_mut()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.members.iter().any(|(n, _)| n == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|(n, _)| n.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
