//! The protocol contract honored by the injected sidecar chain.
//!
//! The chain runs as five pod-local processes in a fixed order: a
//! network-bootstrap init step, a token rotator, a broker registrar, an
//! inbound validator, and an egress exchange proxy. All of them read their
//! configuration from the rendered config bundle through a single
//! watch/diff/swap state machine ([`reload::ConfigWatch`]): the watch task
//! parses each observed bundle and atomically publishes the result; request
//! paths only ever borrow the currently published config, so configuration
//! changes never drop a connection and a malformed bundle never displaces
//! the last known-good one.
//!
//! The identity provider and the broker themselves are external
//! collaborators, reached through the [`identity::TokenSource`] and
//! [`registration::Broker`] seams.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod bootstrap;
pub mod config;
pub mod exchange;
pub mod identity;
pub mod registration;
pub mod reload;
pub mod validator;

pub use self::{
    config::ConfigError,
    reload::{ConfigHandle, ConfigWatch},
};

/// How long the bootstrap step may take before pod start-up proceeds
/// without confirmation.
pub const BOOTSTRAP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
