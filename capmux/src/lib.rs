//! Packet capture agent that takes process signals and captured packets
//! through a single epoll wait on one thread.

pub mod capture;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod signal;
