//! # conduit-foundation
//!
//! Foundation layer for Conduit:
//! - Error: one error taxonomy shared by every layer
//! - Config: `ConduitConfig`, merged from the global and project stores
//! - Storage: `JsonStore` for the config files

pub mod config;
pub mod error;
pub mod storage;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result};

// ============================================================================
// Config
// ============================================================================
pub use config::{
    ConduitConfig, InterruptSettings, LoggingSettings, ProviderSettings, RouterWeights,
    SessionSettings, CONDUIT_CONFIG_FILE,
};

// ============================================================================
// Storage
// ============================================================================
pub use storage::JsonStore;
