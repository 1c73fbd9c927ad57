//! Containment for the agent and its callbacks
//!
//! Two boundaries are guarded here:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Layer 1: CHILD PROCESS                                         │
//! │  no-new-privs, parent-death signal, bounding set capability     │
//! │  drops applied in pre_exec (CapabilityDropper / ChildHardening) │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Layer 2: CALLBACK SERVER                                       │
//! │  loopback bind, token bucket per invocation (RateLimiter),      │
//! │  restricted expression language instead of host code (eval)     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod capabilities;
pub mod rate_limit;

pub use capabilities::{CapabilityDropper, ChildHardening};
pub use rate_limit::{RateLimitError, RateLimiter};
