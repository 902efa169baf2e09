#![deny(unused)]
//! Interception and forwarding for ctrl.
//!
//! [`Interceptor`] runs the synchronous decision pipeline; the
//! [`HttpToolExecutor`] is the default adapter to remote tool servers.

pub mod executor;
pub mod interceptor;

pub use executor::HttpToolExecutor;
pub use interceptor::Interceptor;
