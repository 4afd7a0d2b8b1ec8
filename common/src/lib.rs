//! Latchkey Common Types
//!
//! This crate contains shared types used across the latchkey crates,
//! including owner identifiers, the coordination error type, the store
//! key layout and timing helpers.

pub mod identifiers;
pub mod error;
pub mod keys;
pub mod time;

pub use identifiers::*;
pub use error::*;
pub use keys::*;
pub use time::*;
