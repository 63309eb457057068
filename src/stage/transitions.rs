//! Static table of allowed stage transitions.
//!
//! The table only validates proposed transitions. Execution order is decided
//! by the engine's explicit branch logic; the table never drives it.

use super::StageId;
use crate::error::InvalidTransition;
use std::collections::{BTreeMap, BTreeSet};

/// Mapping of each stage to the set of stages it may move to.
///
/// `Failed` is deliberately absent as a target: only the emergency abort
/// path reaches it, bypassing adjacency checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageTransitionTable {
    edges: BTreeMap<StageId, BTreeSet<StageId>>,
}

impl StageTransitionTable {
    /// The content pipeline's transition table.
    ///
    /// # Example
    ///
    /// ```
    /// use flowguard::stage::{StageId, StageTransitionTable};
    ///
    /// let table = StageTransitionTable::standard();
    /// assert!(table.allows(StageId::Validate, StageId::AlignAudience));
    /// assert!(!table.allows(StageId::Draft, StageId::Finalize));
    /// ```
    #[must_use]
    pub fn standard() -> Self {
        use StageId::*;
        let edges: [(StageId, &[StageId]); 9] = [
            (Validate, &[Research, AlignAudience]),
            (Research, &[AlignAudience]),
            (AlignAudience, &[Draft]),
            (Draft, &[HumanReview]),
            (HumanReview, &[StyleCheck, Draft, AlignAudience]),
            (StyleCheck, &[QualityCheck, Draft, EscalateToHuman]),
            (QualityCheck, &[Finalize, EscalateToHuman, Draft]),
            (EscalateToHuman, &[Finalize]),
            (Finalize, &[Completed]),
        ];
        Self::from_edges(edges.iter().map(|(from, tos)| (*from, tos.iter().copied())))
    }

    /// Build a table from explicit edges.
    pub fn from_edges<I, T>(edges: I) -> Self
    where
        I: IntoIterator<Item = (StageId, T)>,
        T: IntoIterator<Item = StageId>,
    {
        let mut map: BTreeMap<StageId, BTreeSet<StageId>> = BTreeMap::new();
        for (from, tos) in edges {
            map.entry(from).or_default().extend(tos);
        }
        Self { edges: map }
    }

    /// Check if `from -> to` is an allowed transition.
    #[must_use]
    pub fn allows(&self, from: StageId, to: StageId) -> bool {
        self.edges
            .get(&from)
            .is_some_and(|targets| targets.contains(&to))
    }

    /// Validate a proposed transition.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] if the edge is not in the table.
    pub fn validate(&self, from: StageId, to: StageId) -> Result<(), InvalidTransition> {
        if self.allows(from, to) {
            Ok(())
        } else {
            Err(InvalidTransition { from, to })
        }
    }

    /// Allowed next stages from `from`, in pipeline order.
    #[must_use]
    pub fn successors(&self, from: StageId) -> Vec<StageId> {
        self.edges
            .get(&from)
            .map(|targets| targets.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Iterate over all `(from, targets)` rows.
    pub fn rows(&self) -> impl Iterator<Item = (StageId, &BTreeSet<StageId>)> {
        self.edges.iter().map(|(from, tos)| (*from, tos))
    }
}

impl Default for StageTransitionTable {
    fn default() -> Self {
        Self::standard()
    }
}
