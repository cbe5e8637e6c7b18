//! Table-driven finite state machines.
//!
//! A [`FiniteStateMachine`] maps `(state, event)` to an action and a next
//! state. It is assembled once with [`FsmBuilder`] before any session runs
//! and is immutable afterwards, so one `Arc` of it can be shared by every
//! session on every worker.

use std::fmt::{self, Debug, Display};
use std::hash::Hash;
use std::time::Duration;

use crate::error::FsmError;
use crate::session::SessionContext;

/// A small dense identifier: a state or an event.
///
/// Implementations map each value to a distinct index in `0..COUNT`.
/// Usually derived with `#[derive(FsmId)]`.
pub trait FsmId: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    /// Number of distinct values.
    const COUNT: usize;

    /// Dense index of this value.
    fn index(self) -> usize;
}

/// Outcome requested by an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition<S> {
    /// Move to the next state declared in the table.
    Next,
    /// Move to the given state instead of the declared one.
    To(S),
    /// Stay in the current state, e.g. while awaiting external I/O.
    Hold,
}

impl<S> Transition<S> {
    /// Transition to an explicit target state.
    #[must_use]
    pub fn to(state: S) -> Self {
        Self::To(state)
    }

    /// Resolve against the table's declared next state. `None` means hold.
    #[must_use]
    pub fn resolve(self, declared: S) -> Option<S> {
        match self {
            Self::Next => Some(declared),
            Self::To(state) => Some(state),
            Self::Hold => None,
        }
    }
}

/// Protocol definition driven by a transition table.
///
/// The implementing type holds the protocol-specific session fields.
pub trait Machine: Sized + Send + 'static {
    type State: FsmId;
    type Event: FsmId;
    /// Data travelling with an event.
    type Payload: Default + Send + 'static;
    /// Error an action may return. Logged, never fatal.
    type Error: Display;

    /// Build the shared transition table.
    fn transition_table() -> Result<FiniteStateMachine<Self>, FsmError>;

    /// Translate bytes from the session's connection into an event.
    fn on_input(_bytes: &[u8]) -> Option<(Self::Event, Self::Payload)> {
        None
    }
}

/// Result of an action.
pub type ActionResult<M> = Result<Transition<<M as Machine>::State>, <M as Machine>::Error>;

/// Code bound to a `(state, event)` pair.
pub type Action<M> =
    fn(&mut M, &mut SessionContext<'_, M>, <M as Machine>::Payload) -> ActionResult<M>;

/// One row of the table.
pub struct TransitionEntry<M: Machine> {
    pub action: Action<M>,
    pub next: M::State,
    /// Arms a state timeout when this entry lands in `next`.
    pub timeout: Option<Duration>,
}

impl<M: Machine> Clone for TransitionEntry<M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M: Machine> Copy for TransitionEntry<M> {}

impl<M: Machine> Debug for TransitionEntry<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitionEntry")
            .field("next", &self.next)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Mutable assembly stage of a [`FiniteStateMachine`].
pub struct FsmBuilder<M: Machine> {
    initial: M::State,
    entries: Vec<Option<TransitionEntry<M>>>,
    terminal: Vec<bool>,
    close_state: Option<M::State>,
    timeout_event: Option<M::Event>,
}

impl<M: Machine> FsmBuilder<M> {
    pub fn new(initial: M::State) -> Self {
        Self {
            initial,
            entries: vec![None; M::State::COUNT * M::Event::COUNT],
            terminal: vec![false; M::State::COUNT],
            close_state: None,
            timeout_event: None,
        }
    }

    /// Bind `action` to `(state, event)`, moving to `next` on success.
    pub fn define(
        &mut self,
        state: M::State,
        event: M::Event,
        action: Action<M>,
        next: M::State,
    ) -> Result<&mut Self, FsmError> {
        self.insert(state, event, action, next, None)
    }

    /// Like [`define`](Self::define); entering `next` through this row arms a
    /// state timeout of `timeout`.
    pub fn define_with_timeout(
        &mut self,
        state: M::State,
        event: M::Event,
        action: Action<M>,
        next: M::State,
        timeout: Duration,
    ) -> Result<&mut Self, FsmError> {
        self.insert(state, event, action, next, Some(timeout))
    }

    fn insert(
        &mut self,
        state: M::State,
        event: M::Event,
        action: Action<M>,
        next: M::State,
        timeout: Option<Duration>,
    ) -> Result<&mut Self, FsmError> {
        check_index(state)?;
        check_index(event)?;
        check_index(next)?;
        let slot = &mut self.entries[slot_of::<M>(state, event)];
        if slot.is_some() {
            return Err(FsmError::DuplicateTransition {
                state: format!("{state:?}"),
                event: format!("{event:?}"),
            });
        }
        *slot = Some(TransitionEntry {
            action,
            next,
            timeout,
        });
        Ok(self)
    }

    /// Mark `state` terminal: a session entering it closes.
    pub fn terminal(&mut self, state: M::State) -> Result<&mut Self, FsmError> {
        check_index(state)?;
        self.terminal[state.index()] = true;
        Ok(self)
    }

    /// State a session enters when its connection closes.
    pub fn on_close(&mut self, state: M::State) -> Result<&mut Self, FsmError> {
        check_index(state)?;
        self.close_state = Some(state);
        Ok(self)
    }

    /// Event dispatched when a state timeout expires.
    pub fn timeout_event(&mut self, event: M::Event) -> Result<&mut Self, FsmError> {
        check_index(event)?;
        self.timeout_event = Some(event);
        Ok(self)
    }

    pub fn build(self) -> Result<FiniteStateMachine<M>, FsmError> {
        check_index(self.initial)?;
        Ok(FiniteStateMachine {
            initial: self.initial,
            entries: self.entries.into_boxed_slice(),
            terminal: self.terminal.into_boxed_slice(),
            close_state: self.close_state,
            timeout_event: self.timeout_event,
        })
    }
}

/// Immutable `(state, event) -> (action, next state)` table.
pub struct FiniteStateMachine<M: Machine> {
    initial: M::State,
    entries: Box<[Option<TransitionEntry<M>>]>,
    terminal: Box<[bool]>,
    close_state: Option<M::State>,
    timeout_event: Option<M::Event>,
}

impl<M: Machine> FiniteStateMachine<M> {
    pub fn builder(initial: M::State) -> FsmBuilder<M> {
        FsmBuilder::new(initial)
    }

    /// O(1) lookup. `None` means the event is not expected in `state`.
    pub fn lookup(&self, state: M::State, event: M::Event) -> Option<&TransitionEntry<M>> {
        if state.index() >= M::State::COUNT || event.index() >= M::Event::COUNT {
            return None;
        }
        self.entries[slot_of::<M>(state, event)].as_ref()
    }

    pub fn initial(&self) -> M::State {
        self.initial
    }

    pub fn is_terminal(&self, state: M::State) -> bool {
        self.terminal.get(state.index()).copied().unwrap_or(false)
    }

    pub fn close_state(&self) -> Option<M::State> {
        self.close_state
    }

    pub fn timeout_event(&self) -> Option<M::Event> {
        self.timeout_event
    }

    /// Number of defined transitions.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<M: Machine> Debug for FiniteStateMachine<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiniteStateMachine")
            .field("initial", &self.initial)
            .field("transitions", &self.len())
            .field("close_state", &self.close_state)
            .field("timeout_event", &self.timeout_event)
            .finish()
    }
}

fn slot_of<M: Machine>(state: M::State, event: M::Event) -> usize {
    state.index() * M::Event::COUNT + event.index()
}

fn check_index<T: FsmId>(id: T) -> Result<(), FsmError> {
    if id.index() < T::COUNT {
        Ok(())
    } else {
        Err(FsmError::IndexOutOfRange {
            name: format!("{id:?}"),
            index: id.index(),
            count: T::COUNT,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Light {
        Red,
        Green,
        Yellow,
        Broken,
    }

    impl FsmId for Light {
        const COUNT: usize = 4;
        fn index(self) -> usize {
            self as usize
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Tick {
        Go,
        Slow,
        Stop,
        Rogue,
    }

    impl FsmId for Tick {
        const COUNT: usize = 3;
        fn index(self) -> usize {
            self as usize
        }
    }

    #[derive(Default)]
    struct Traffic {
        ticks: u32,
    }

    impl Machine for Traffic {
        type State = Light;
        type Event = Tick;
        type Payload = ();
        type Error = String;

        fn transition_table() -> Result<FiniteStateMachine<Self>, FsmError> {
            let mut builder = FsmBuilder::new(Light::Red);
            builder
                .define(Light::Red, Tick::Go, count, Light::Green)?
                .define(Light::Green, Tick::Slow, count, Light::Yellow)?
                .define_with_timeout(
                    Light::Yellow,
                    Tick::Stop,
                    count,
                    Light::Red,
                    Duration::from_secs(1),
                )?
                .terminal(Light::Broken)?;
            builder.build()
        }
    }

    fn count(m: &mut Traffic, _: &mut SessionContext<'_, Traffic>, _: ()) -> ActionResult<Traffic> {
        m.ticks += 1;
        Ok(Transition::Next)
    }

    #[test]
    fn lookup_finds_defined_rows() {
        let table = Traffic::transition_table().unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.initial(), Light::Red);
        assert_eq!(table.lookup(Light::Red, Tick::Go).unwrap().next, Light::Green);
        assert_eq!(
            table.lookup(Light::Yellow, Tick::Stop).unwrap().timeout,
            Some(Duration::from_secs(1))
        );
    }

    #[test]
    fn missing_row_is_none() {
        let table = Traffic::transition_table().unwrap();
        assert!(table.lookup(Light::Red, Tick::Stop).is_none());
        assert!(table.lookup(Light::Broken, Tick::Go).is_none());
    }

    #[test]
    fn lookup_is_deterministic() {
        let table = Traffic::transition_table().unwrap();
        let first = table.lookup(Light::Green, Tick::Slow).unwrap();
        let second = table.lookup(Light::Green, Tick::Slow).unwrap();
        assert_eq!(first.next, second.next);
        assert_eq!(first.action as usize, second.action as usize);
    }

    #[test]
    fn duplicate_row_is_rejected() {
        let mut builder = FsmBuilder::<Traffic>::new(Light::Red);
        builder.define(Light::Red, Tick::Go, count, Light::Green).unwrap();
        let err = builder
            .define(Light::Red, Tick::Go, count, Light::Yellow)
            .err()
            .unwrap();
        assert_eq!(
            err,
            FsmError::DuplicateTransition {
                state: "Red".into(),
                event: "Go".into()
            }
        );
    }

    #[test]
    fn out_of_range_identifier_is_rejected() {
        let mut builder = FsmBuilder::<Traffic>::new(Light::Red);
        let err = builder
            .define(Light::Red, Tick::Rogue, count, Light::Green)
            .err()
            .unwrap();
        assert!(matches!(err, FsmError::IndexOutOfRange { index: 3, count: 3, .. }));
    }

    #[test]
    fn terminal_and_close_states() {
        let table = Traffic::transition_table().unwrap();
        assert!(table.is_terminal(Light::Broken));
        assert!(!table.is_terminal(Light::Red));
        assert_eq!(table.close_state(), None);
        assert_eq!(table.timeout_event(), None);
    }

    #[test]
    fn transition_resolves_against_declared_state() {
        assert_eq!(Transition::Next.resolve(Light::Green), Some(Light::Green));
        assert_eq!(Transition::to(Light::Broken).resolve(Light::Green), Some(Light::Broken));
        assert_eq!(Transition::<Light>::Hold.resolve(Light::Green), None);
    }
}
