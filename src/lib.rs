#![deny(missing_docs)]
//! # kvbridge
//!
//! This crate bridges an interactive caller and a key-value backend: requests
//! run on a per-connection worker, their results are merged into a local
//! mirror of the backend's databases, and key ttls count down client-side.
pub mod protocol;

pub mod event;

pub mod driver;

pub mod translator;

pub mod mirror;

pub mod state;

pub mod ticker;

pub mod server;

pub mod config;

pub mod sled_driver;

pub mod types;

pub mod error;

mod worker;

pub use crate::config::BridgeConfig;
pub use crate::driver::{Driver, DriverContext};
pub use crate::error::{BridgeError, ErrorInfo, ErrorKind, Result};
pub use crate::event::Event;
pub use crate::mirror::DatabaseMirror;
pub use crate::server::Server;
pub use crate::sled_driver::SledDriver;
pub use crate::state::ServerState;
pub use crate::types::{Key, KeyValue, Ttl};
