//! Plugin lifecycle states.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a registry entry.
///
/// The happy path is strictly linear:
/// `Unloaded -> Loading -> Loaded -> Initializing -> Active -> Unloading`.
/// Any in-flight or active state may fall to `Error`, and an `Error` entry may
/// only leave through `Unloading`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
pub enum PluginState {
    #[default]
    Unloaded,
    Loading,
    Loaded,
    Initializing,
    Active,
    Error,
    Unloading,
}

impl PluginState {
    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: PluginState) -> bool {
        use PluginState::*;
        matches!(
            (self, next),
            (Unloaded, Loading)
                | (Loading, Loaded)
                | (Loaded, Initializing)
                | (Initializing, Active)
                | (Active, Unloading)
                | (Loading | Loaded | Initializing | Active, Error)
                | (Error, Unloading)
                | (Unloading, Unloaded)
        )
    }

    /// Whether the entry currently holds a live plugin instance.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }

    /// Whether the entry is mid-load.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Loading | Self::Loaded | Self::Initializing | Self::Unloading
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_happy_path_is_allowed() {
        let path = [
            PluginState::Unloaded,
            PluginState::Loading,
            PluginState::Loaded,
            PluginState::Initializing,
            PluginState::Active,
            PluginState::Unloading,
            PluginState::Unloaded,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_no_skipping() {
        assert!(!PluginState::Loading.can_transition_to(PluginState::Active));
        assert!(!PluginState::Unloaded.can_transition_to(PluginState::Active));
        assert!(!PluginState::Loaded.can_transition_to(PluginState::Active));
        assert!(!PluginState::Error.can_transition_to(PluginState::Active));
    }

    #[test]
    fn test_error_reachable_from_live_states_only() {
        for state in PluginState::iter() {
            let expected = matches!(
                state,
                PluginState::Loading
                    | PluginState::Loaded
                    | PluginState::Initializing
                    | PluginState::Active
            );
            assert_eq!(state.can_transition_to(PluginState::Error), expected, "{state}");
        }
    }

    #[test]
    fn test_parse_round_trip_names() {
        assert_eq!("Active".parse::<PluginState>().unwrap(), PluginState::Active);
        assert_eq!(PluginState::Initializing.to_string(), "Initializing");
    }
}
