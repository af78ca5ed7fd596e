//! HMAC-SHA256 request signer for the object manager protocol
//!
//! Every request carries a `time` field and a hex `signature` computed over a
//! canonical message: the concatenation of specific field values, in a fixed
//! per-operation order, with no separators. The server recomputes the same
//! string, so the byte layout here must never change:
//!
//! - store: `time + collection + md5(file bytes) + md5(attributes json)`
//! - delete / url: `time + id`

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::om::types::SignedRequest;

type HmacSha256 = Hmac<Sha256>;

/// Hex HMAC-SHA256 of `message` under `secret_key`.
pub fn sign(secret_key: &[u8], message: &[u8]) -> String {
    hex::encode(hmac_sha256(secret_key, message))
}

/// Lowercase hex MD5 digest, as used for file contents and attribute JSON.
pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Canonical message for a store request.
pub fn store_message(time: i64, collection: &str, file_md5: &str, attributes_md5: &str) -> String {
    let mut message = String::with_capacity(20 + collection.len() + 64);
    message.push_str(&time.to_string());
    message.push_str(collection);
    message.push_str(file_md5);
    message.push_str(attributes_md5);
    message
}

/// Canonical message for requests addressing a single object (delete, url).
pub fn object_message(time: i64, object_id: &str) -> String {
    let mut message = String::with_capacity(20 + object_id.len());
    message.push_str(&time.to_string());
    message.push_str(object_id);
    message
}

/// HMAC-SHA256 returning fixed-size array (no heap allocation)
fn hmac_sha256(key: &[u8], msg: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(msg);
    let result = mac.finalize().into_bytes();
    let mut output = [0u8; 32];
    output.copy_from_slice(&result);
    output
}

/// Signs object manager requests with a shared secret key
#[derive(Clone)]
pub struct RequestSigner {
    secret_key: Vec<u8>,
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner")
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

impl RequestSigner {
    /// Create a new signer
    pub fn new(secret_key: impl Into<Vec<u8>>) -> Self {
        Self {
            secret_key: secret_key.into(),
        }
    }

    /// Current unix time in seconds, the value sent as the `time` field
    pub fn now() -> i64 {
        Utc::now().timestamp()
    }

    /// Sign an arbitrary canonical message
    pub fn sign(&self, message: &str) -> String {
        sign(&self.secret_key, message.as_bytes())
    }

    /// Build the signed field set for a store request.
    ///
    /// `file_md5` is the hex digest of the whole file; the attributes digest is
    /// taken over `attributes_json` exactly as it will be transmitted.
    pub fn sign_store(
        &self,
        time: i64,
        collection: &str,
        file_md5: &str,
        attributes_json: &str,
    ) -> SignedRequest {
        let attributes_md5 = md5_hex(attributes_json.as_bytes());
        let signature = self.sign(&store_message(time, collection, file_md5, &attributes_md5));

        SignedRequest::new(
            time,
            vec![
                ("time", time.to_string()),
                ("collection", collection.to_string()),
                ("attributes", attributes_json.to_string()),
            ],
            signature,
        )
    }

    /// Build the signed field set for a delete or url request
    pub fn sign_object(&self, time: i64, object_id: &str) -> SignedRequest {
        let signature = self.sign(&object_message(time, object_id));

        SignedRequest::new(
            time,
            vec![("time", time.to_string()), ("id", object_id.to_string())],
            signature,
        )
    }
}
