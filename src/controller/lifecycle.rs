//! Controller lifecycle states

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one installed controller version.
///
/// ```text
/// parsed -> installing -> installed -> activating -> activated
///               |             |             |            |
///               +-------------+------> redundant <-------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Created, install not started
    Parsed,
    /// Pre-warming the static generation
    Installing,
    /// Installed and waiting for the previous controller to release
    Installed,
    /// Purging stale generations and claiming pages
    Activating,
    /// Serving fetches and messages
    Activated,
    /// Superseded or failed; terminal
    Redundant,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parsed => "parsed",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Activated => "activated",
            Self::Redundant => "redundant",
        }
    }

    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (*self, next),
            (Parsed, Installing)
                | (Installing, Installed)
                | (Installed, Activating)
                | (Activating, Activated)
                | (Parsed | Installing | Installed | Activating | Activated, Redundant)
        )
    }

    /// Waiting for the page set to be released by the previous controller
    pub fn is_waiting(&self) -> bool {
        *self == Self::Installed
    }

    pub fn is_terminal(&self) -> bool {
        *self == Self::Redundant
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
