//! Session lifecycle state
//!
//! [`types`] holds the plain value types ([`SessionState`], [`SessionRole`],
//! [`FatalErrorKind`]); [`machine`] holds the mutex-guarded
//! [`SessionStateMachine`] that owns every transition.

pub mod machine;
pub mod types;

pub use machine::{
    Followup, GoodbyeOutcome, HandshakeInfo, SessionSnapshot, SessionStateMachine,
    StateMachineTimeouts, DEFAULT_SESSION_QUALIFIER,
};
pub use types::{FatalErrorKind, SessionRole, SessionState};
