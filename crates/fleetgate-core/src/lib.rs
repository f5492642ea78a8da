//! Core access-control and session-lifecycle engine for fleetgate
//!
//! This crate is the heart of fleetgated, containing:
//! - Identity resolution from credentials or a bound device identifier
//! - The access policy (role dispatch consulting the assignment
//!   directory)
//! - The usage-session state machine (Open -> Closed, whole-minute
//!   durations)
//! - Registration intake for unknown devices
//!
//! The engine holds no state of its own beyond a store handle; every
//! operation is a store round-trip, safe to run concurrently with any
//! other.

mod engine;
mod error;
mod policy;
mod registration;
mod resolver;
mod secret;

pub use engine::*;
pub use error::*;
pub use policy::*;
pub use registration::*;
pub use resolver::*;
pub use secret::*;
