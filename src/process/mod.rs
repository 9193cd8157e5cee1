//! Process management module
//!
//! Runs tool commands as child processes with piped stdio so stdout,
//! stderr and stdin can be handled independently.

#[allow(dead_code)]
mod child;

pub use child::*;
