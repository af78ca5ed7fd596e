//! Object manager protocol client
//!
//! This module provides:
//! - HMAC-SHA256 request signing over per-operation canonical messages
//! - Async operations (store, delete, url, stream, fetch)
//! - Object attribute and signed request types

pub mod client;
pub mod multipart;
pub mod signer;
pub mod types;

// Re-export main types for convenience
pub use client::{validate_collection, ClientError, ObjectClient, Result};
pub use signer::{md5_hex, object_message, sign, store_message, RequestSigner};
pub use types::{Access, ObjectAttributes, ObjectId, ObjectUrl, Redirect, SignedRequest};
