//! Attribute parsing for the FSM macro.

use darling::FromMeta;
use darling::util::PathList;
use syn::{LitStr, Path};

/// Arguments for the `#[fsm]` attribute.
#[derive(Debug, FromMeta)]
pub struct FsmArgs {
    /// Initial state (required).
    pub initial: Path,

    /// States that close the session when entered.
    #[darling(default)]
    pub terminal: PathList,

    /// State entered when the connection closes.
    pub close: Option<Path>,

    /// Event dispatched when a state timeout expires.
    pub timeout_event: Option<Path>,
}

/// Arguments for the `#[on(state = Idle, event = Start, next = Running)]`
/// attribute. Repeatable.
#[derive(Debug, Clone, FromMeta)]
pub struct OnAttr {
    /// Source state this action is valid in.
    pub state: Path,
    /// Event that triggers this action.
    pub event: Path,
    /// State entered when the action returns `Transition::Next`.
    pub next: Path,
}

/// Arguments for the `#[state_timeout]` attribute.
#[derive(Debug, Clone, FromMeta)]
pub struct StateTimeoutAttr {
    /// Duration string (e.g., "30s", "5m").
    pub duration: LitStr,
}
