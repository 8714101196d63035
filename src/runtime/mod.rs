//! Single-threaded readiness runtime.
//!
//! - `EventLoop`: owns the notifier and every interest record, dispatches
//!   one callback per ready descriptor per cycle
//! - `listener`: listening socket setup and the accept handler
//! - `connection`: per-connection state and the echo read handler
//!
//! Callbacks run to completion one at a time on the loop's thread; the
//! only blocking point is the loop's wait for readiness.

mod connection;
mod event_loop;
mod interest;
mod listener;

pub use event_loop::EventLoop;
pub use listener::start_listening;
