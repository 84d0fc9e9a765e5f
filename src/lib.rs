//! Prefork - a prefork HTTP server
//!
//! This library provides a supervisor that:
//! - Binds one listen socket and shares it with a pool of worker processes
//! - Replaces workers that crash, hang or stop sending heartbeats
//! - Performs rolling reloads without dropping capacity
//! - Drains workers gracefully on shutdown, retirement or resize
//!
//! Each worker runs a single-threaded dispatcher that serves HTTP/1.1 (or
//! HTTPS) connections from the shared socket and hands requests to an
//! [`app::Application`], isolating handler faults per request.

#[cfg(not(unix))]
compile_error!("prefork requires a Unix platform (fork/exec, descriptor inheritance and signals)");

pub mod admin;
pub mod app;
pub mod binder;
pub mod config;
pub mod demo;
pub mod dispatcher;
pub mod error;
pub mod process;
pub mod protocol;
pub mod supervisor;
pub mod tls;
pub mod worker;
