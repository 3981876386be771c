//! Connection resilience
//!
//! Decides from connection lifecycle, tab visibility and network
//! reachability whether the transport should be open. The decision logic
//! lives in the pure [`machine`]; [`driver`] runs it on tokio.

pub mod driver;
pub mod machine;

pub use driver::{spawn_connection, ConnectionHandle, ConnectionNotification, ConnectionStatus};
pub use machine::{
    is_local_endpoint, ConnectionMachine, ConnectionPhase, Effect, Event, IdlePhase, Keepalive,
    OpenPhase, Reachability, TabVisibility, TimerKind,
};
