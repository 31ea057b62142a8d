use serde::{Deserialize, Serialize};

/// Lifecycle of a tile.
///
/// `Idle -> Loading -> {Loaded, Error, Empty}`; `Error` may go back to
/// `Idle` on a retry, and disposal moves any state to the terminal `Abort`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TileState {
    Idle,
    Loading,
    Loaded,
    /// The fetch failed; a later `load()` retries
    Error,
    /// The fetch succeeded but produced no content
    Empty,
    /// Disposed; results arriving afterwards are discarded
    Abort,
}

impl TileState {
    /// No load is pending in this state
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            TileState::Loaded | TileState::Error | TileState::Empty | TileState::Abort
        )
    }
}

impl Default for TileState {
    fn default() -> Self {
        TileState::Idle
    }
}
