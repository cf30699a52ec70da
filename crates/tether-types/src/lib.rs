//! Core types shared across all tether crates.
//!
//! Defines the agent configuration, the startup error type, and the wire
//! types exchanged with the management plane.

pub mod config;
pub mod envelope;
pub mod error;

pub use config::{
    AgentConfig, ControlConfig, DeliveryConfig, ServerConfig, DEFAULT_CONFIG_PATH,
};
pub use envelope::{
    ack_path, fin_path, CommandFinish, CommandRef, Envelope, EnvelopeError, Query,
    COMMAND_EVENT_PRIORITY, INTERNAL_SHELL, PING_JSON,
};
pub use error::TetherError;
