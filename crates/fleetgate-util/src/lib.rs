//! Shared utilities for fleetgate
//!
//! This crate provides:
//! - ID types (IdentityId, MachineId, AssignmentId, SessionId)
//! - The Role enum used by the access policy
//! - Time utilities (UTC clock, whole-minute duration math)

mod ids;
mod role;
mod time;

pub use ids::*;
pub use role::*;
pub use time::*;
