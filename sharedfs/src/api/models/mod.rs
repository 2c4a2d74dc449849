//! API response models.
//!
//! Every envelope carries the agent's configured `name` so the broker can tell which agent
//! answered.
//!
//! - [`system`]: capacity discovery
//! - [`services`]: lifecycle results and credentials

pub mod services;
pub mod system;
