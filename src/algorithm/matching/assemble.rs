//! Result assembly
//!
//! Attaches run metadata to matched-set collections and maps internal unit
//! ids back to the identifiers found in the input.

use crate::algorithm::matching::types::{MatchedSetCollection, MatchedSetMetadata, PanelMatchResult};
use crate::config::{PanelMatchConfig, Qoi};
use crate::error::Result;
use crate::panel::{UnitId, UnitIndex, UnitKey};

/// Metadata of the collection produced for `side` under `config`
#[must_use]
pub fn metadata_for(config: &PanelMatchConfig, side: Qoi) -> MatchedSetMetadata {
    MatchedSetMetadata {
        qoi: side,
        lead: config.normalized_lead(),
        outcome_var: config.outcome_var.clone(),
        forbid_treatment_reversal: config.forbid_treatment_reversal,
        lag: config.effective_lag(),
        refinement_method: config.refinement_method,
        exact_match_variables: config.exact_match_variables.clone(),
    }
}

/// Replace internal unit ids with original identifiers
///
/// # Errors
///
/// Returns [`crate::error::PanelMatchError::UnknownUnitId`] if the collection
/// refers to an id the index never issued.
pub fn decode_collection(
    collection: MatchedSetCollection<UnitId>,
    index: &UnitIndex,
) -> Result<MatchedSetCollection<UnitKey>> {
    collection.try_map_ids(|id| index.decode(id).cloned())
}

/// Collect per-side collections into a result for `qoi`
#[must_use]
pub fn assemble_result<Id>(qoi: Qoi, sides: Vec<MatchedSetCollection<Id>>) -> PanelMatchResult<Id> {
    let mut result = PanelMatchResult {
        qoi,
        att: None,
        atc: None,
    };
    for collection in sides {
        match collection.metadata.qoi {
            Qoi::Att | Qoi::Ate => result.att = Some(collection),
            Qoi::Atc => result.atc = Some(collection),
        }
    }
    result
}
