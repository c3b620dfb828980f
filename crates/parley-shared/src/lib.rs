//! # parley-shared
//!
//! Domain model, wire shapes and error taxonomy shared by the transport,
//! cache and client crates.

pub mod constants;
pub mod error;
pub mod models;
pub mod protocol;
pub mod types;

pub use error::{ChatError, Result};
