//! omclient - client for an HMAC-signed object manager server

pub mod config;
pub mod om;

pub use config::{ClientConfig, Config};
pub use om::{Access, ClientError, ObjectAttributes, ObjectClient, Redirect};
