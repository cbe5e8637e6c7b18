//! # shard-fsm
//!
//! A sharded pool of single-threaded workers running table-driven finite
//! state machine sessions.
//!
//! Every session is pinned to the worker `key % threads`, so all of its
//! events, timers and I/O completions run on one thread, one at a time.
//!
//! ## Example
//!
//! ```rust
//! use shard_fsm::{ActionResult, FsmId, SessionContext, Transition, WorkerPool, fsm};
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FsmId)]
//! enum LightState { Off, On }
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FsmId)]
//! enum LightEvent { Toggle }
//!
//! struct Light { flips: u32 }
//!
//! #[fsm(initial = Off)]
//! impl Light {
//!     type State = LightState;
//!     type Event = LightEvent;
//!     type Payload = ();
//!     type Error = std::convert::Infallible;
//!
//!     #[on(state = Off, event = Toggle, next = On)]
//!     #[on(state = On, event = Toggle, next = Off)]
//!     fn flip(&mut self, _: &mut SessionContext<'_, Self>, _: ()) -> ActionResult<Self> {
//!         self.flips += 1;
//!         Ok(Transition::Next)
//!     }
//! }
//! ```

extern crate self as shard_fsm;

pub mod cloud_sync;

#[doc(inline)]
pub use shard_fsm_core::*;
#[doc(inline)]
pub use shard_fsm_macros::*;
