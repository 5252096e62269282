//! Engine state tree

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// States of the engine. Dispatch tries the current state first, then
/// each ancestor up to [`EngineState::Top`].
///
/// ```text
/// Top
/// ├── TopError
/// ├── TopUnconfigured      (initial)
/// ├── TopReconfiguring
/// └── TopConfigured
///     ├── TopConfiguredIdle
///     └── TopConfiguredPlay
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EngineState {
    Top = 0,
    TopError = 1,
    TopUnconfigured = 2,
    TopReconfiguring = 3,
    TopConfigured = 4,
    TopConfiguredIdle = 5,
    TopConfiguredPlay = 6,
}

use EngineState::*;

/// Parent of each state, indexed by discriminant.
const PARENTS: [Option<EngineState>; 7] = [
    None,
    Some(Top),
    Some(Top),
    Some(Top),
    Some(Top),
    Some(TopConfigured),
    Some(TopConfigured),
];

impl EngineState {
    pub const ALL: [EngineState; 7] = [
        Top,
        TopError,
        TopUnconfigured,
        TopReconfiguring,
        TopConfigured,
        TopConfiguredIdle,
        TopConfiguredPlay,
    ];

    pub const fn parent(self) -> Option<EngineState> {
        PARENTS[self as usize]
    }

    /// This state followed by its ancestors.
    pub fn lineage(self) -> impl Iterator<Item = EngineState> {
        std::iter::successors(Some(self), |state| state.parent())
    }

    pub fn is_configured(self) -> bool {
        self.lineage().any(|state| state == TopConfigured)
    }

    pub fn name(self) -> &'static str {
        match self {
            Top => "TOP",
            TopError => "TOP_ERROR",
            TopUnconfigured => "TOP_UNCONFIGURED",
            TopReconfiguring => "TOP_RECONFIGURING",
            TopConfigured => "TOP_CONFIGURED",
            TopConfiguredIdle => "TOP_CONFIGURED_IDLE",
            TopConfiguredPlay => "TOP_CONFIGURED_PLAY",
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Current state published for other threads.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: EngineState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> EngineState {
        EngineState::from_u8(self.0.load(Ordering::Acquire)).unwrap_or(Top)
    }

    pub fn set(&self, state: EngineState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_table() {
        assert_eq!(Top.parent(), None);
        for state in [TopError, TopUnconfigured, TopReconfiguring, TopConfigured] {
            assert_eq!(state.parent(), Some(Top));
        }
        assert_eq!(TopConfiguredIdle.parent(), Some(TopConfigured));
        assert_eq!(TopConfiguredPlay.parent(), Some(TopConfigured));
    }

    #[test]
    fn test_lineage_walks_to_root() {
        let lineage: Vec<_> = TopConfiguredPlay.lineage().collect();
        assert_eq!(lineage, vec![TopConfiguredPlay, TopConfigured, Top]);
        assert_eq!(Top.lineage().count(), 1);
    }

    #[test]
    fn test_is_configured() {
        assert!(TopConfiguredIdle.is_configured());
        assert!(TopConfigured.is_configured());
        assert!(!TopReconfiguring.is_configured());
        assert!(!TopError.is_configured());
    }

    #[test]
    fn test_state_cell() {
        let cell = StateCell::new(TopUnconfigured);
        assert_eq!(cell.get(), TopUnconfigured);
        cell.set(TopConfiguredPlay);
        assert_eq!(cell.get(), TopConfiguredPlay);
        for state in EngineState::ALL {
            assert_eq!(EngineState::from_u8(state as u8), Some(state));
        }
    }
}
