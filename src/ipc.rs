//! Daemon side: worker pipeline plus the local control socket.

mod dispatch;
mod pipeline;
mod runtime;
mod server;

pub use server::{client_request, run_daemon};
