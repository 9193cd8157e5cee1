//! Configuration module
//!
//! Handles loading the tool catalog and session limits.

mod tools;

pub use tools::*;
