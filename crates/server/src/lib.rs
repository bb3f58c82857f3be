// Copyright 2025-2026 CEMAXECUTER LLC

//! Server side of the TCP SDR remoting protocol.
//!
//! One main thread owns the listener, the connection registry and all
//! RPC/LOG socket I/O. Each active sample stream owns two worker threads:
//! a device-facing data pump and a socket-facing network pump, joined by a
//! bounded jitter pipe.

pub mod dispatch;
pub mod logging;
pub mod pipe;
pub mod pump;
pub mod registry;
pub mod server;
