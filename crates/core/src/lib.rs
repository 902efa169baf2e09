#![deny(unused)]
//! Core types, traits, and error definitions for ctrl.
//!
//! This crate provides the foundational building blocks shared across the
//! control plane: the request/decision/event data model, config schemas,
//! canonical JSON hashing, wildcard matching and the remote-executor seam.

pub mod canonical;
pub mod config;
pub mod error;
pub mod events;
pub mod glob;
pub mod mocks;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use events::EventType;
pub use traits::ToolExecutor;
pub use types::{DecisionRow, EventRow, RequestRow, RequestStatus, ToolCallRequest};
