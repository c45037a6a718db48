//! Config - merged configuration
//!
//! - `conduit.rs` - ConduitConfig (interrupt, session, providers, router, logging)

mod conduit;

pub use conduit::{
    ConduitConfig, InterruptSettings, LoggingSettings, ProviderSettings, RouterWeights,
    SessionSettings, CONDUIT_CONFIG_FILE,
};
