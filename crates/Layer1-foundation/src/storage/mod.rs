//! Storage module for Conduit
//!
//! - `json`: JSON files for configuration (global + project stores)

mod json;

pub use json::JsonStore;
