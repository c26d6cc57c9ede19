//! Cardinality checks over a match set.
//!
//! A live query reports every match; most consumers want exactly one visible
//! element. [`MatchFilter::select`] narrows a match set and turns the ways it
//! can fall short into `warn` outcomes that resolve on their own once the tree
//! changes.

use serde::{Deserialize, Serialize};

use crate::element::{ElementInfo, VisibilitySummary};
use crate::outcome::Outcome;
use crate::tree::NodeId;

/// Message for an empty match set.
pub const NO_MATCH: &str = "matched 0 elements.";

/// Message when every match is hidden and only visible ones are wanted.
pub const ELEMENT_HIDDEN: &str = "element hidden";

/// Message for more candidates than allowed.
pub fn too_many(count: usize) -> String {
    format!("matched {count} elements (need exactly 1).")
}

/// Which matches a derived view accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatchFilter {
    /// Ignore hidden matches.
    pub visible_only: bool,
    /// Accept more than one remaining match.
    pub allow_multiple: bool,
}

impl Default for MatchFilter {
    fn default() -> Self {
        Self::single()
    }
}

impl MatchFilter {
    /// Exactly one visible element.
    pub const fn single() -> Self {
        Self {
            visible_only: true,
            allow_multiple: false,
        }
    }

    /// Every match, visible or not.
    pub const fn any() -> Self {
        Self {
            visible_only: false,
            allow_multiple: true,
        }
    }

    /// Narrows `infos` to the accepted elements, in match order.
    pub fn select(&self, infos: &[ElementInfo]) -> Outcome<Vec<NodeId>> {
        if infos.is_empty() {
            return Outcome::warn(NO_MATCH);
        }
        if self.visible_only && VisibilitySummary::of(infos).all_hidden() {
            return Outcome::warn(ELEMENT_HIDDEN);
        }
        let candidates: Vec<NodeId> = infos
            .iter()
            .filter(|info| !self.visible_only || info.is_visible)
            .map(|info| info.element)
            .collect();
        if !self.allow_multiple && candidates.len() > 1 {
            return Outcome::warn(too_many(candidates.len()));
        }
        Outcome::ok(candidates)
    }
}
