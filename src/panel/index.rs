//! Unit identifier re-encoding
//!
//! Original unit identifiers (integers, integral floats or strings) are mapped
//! onto a dense `1..=U` integer space in order of first appearance. The map is
//! built once per matching call and consulted again when results are decoded.

use std::fmt;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{PanelMatchError, Result};

/// Dense internal unit id, starting at 1
pub type UnitId = u32;

/// Original unit identifier as found in the input data
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UnitKey {
    /// Integer or integral numeric identifier
    Int(i64),
    /// String identifier
    Str(String),
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for UnitKey {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for UnitKey {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for UnitKey {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

/// Bijection between original unit identifiers and dense internal ids
#[derive(Debug, Clone, Default)]
pub struct UnitIndex {
    keys: Vec<UnitKey>,
    lookup: FxHashMap<UnitKey, UnitId>,
}

impl UnitIndex {
    /// Create an empty index
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the internal id for `key`, issuing the next id if it is new
    pub fn encode(&mut self, key: UnitKey) -> UnitId {
        if let Some(&id) = self.lookup.get(&key) {
            return id;
        }
        self.keys.push(key.clone());
        let id = self.keys.len() as UnitId;
        self.lookup.insert(key, id);
        id
    }

    /// Look up an already issued id without inserting
    #[must_use]
    pub fn id_of(&self, key: &UnitKey) -> Option<UnitId> {
        self.lookup.get(key).copied()
    }

    /// Decode an internal id back into the original identifier
    pub fn decode(&self, id: UnitId) -> Result<&UnitKey> {
        id.checked_sub(1)
            .and_then(|i| self.keys.get(i as usize))
            .ok_or(PanelMatchError::UnknownUnitId(id))
    }

    /// Iterate over issued ids in order
    pub fn ids(&self) -> impl Iterator<Item = UnitId> + use<> {
        1..=self.keys.len() as UnitId
    }

    /// Number of distinct units
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no unit has been encoded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
