//! Core contract for the point-of-sale sync client.
//!
//! This crate defines the session and resource data model, outcome
//! classification, backoff policy, the per-resource fetch state machine and
//! the observer/signal channel primitives. It performs no I/O.

/// Observer and invalidation-signal channel primitives.
pub mod channel;
/// Classified request errors and HTTP status mapping.
pub mod error;
/// Backoff policy used by retry loops.
pub mod retry;
/// Role and capability predicates.
pub mod roles;
/// Per-resource fetch state machine.
pub mod state_machine;
/// Session, resource and signal types.
pub mod types;

pub use channel::{SignalReceiver, SignalSender, StateChannel, signal_channel};
pub use error::{RequestError, RequestErrorCategory, ValidationDetails, classify_http_status};
pub use retry::RetryPolicy;
pub use roles::{has_any_role, has_capability, has_role};
pub use state_machine::{ResourceStateMachine, TransitionRejected};
pub use types::{
    Attempted, AuthChange, AuthState, AuthStatus, AuthUser, HealthStatus, InvalidationSignal,
    Order, OrderItem, Product, RealtimeConfig, RequestOutcome, ResourceKey, ResourcePhase,
    ResourceState, Role, Session, SignIn, SignalKind, TERMINALS_UPDATED_KEY, Terminal,
    TerminalCatalog, TerminalDraft,
};
