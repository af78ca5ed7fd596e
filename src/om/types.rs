//! Object manager request and response types

use bytes::Bytes;
use http_body_util::Empty;
use hyper::header::{HeaderValue, LOCATION};
use hyper::{Response, StatusCode};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Opaque object identifier returned by the server on store
pub type ObjectId = String;

/// Opaque object URL returned by the server; protected objects get a
/// short-lived URL carrying its own `time`, `id` and `signature` parameters.
pub type ObjectUrl = String;

/// Object access level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    /// Freely retrievable, may be cached for `cache_age` seconds
    Public,
    /// Reachable only through a signed URL valid for `ttl` seconds
    Protected,
}

impl Access {
    pub fn as_str(&self) -> &'static str {
        match self {
            Access::Public => "public",
            Access::Protected => "protected",
        }
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Access {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Access::Public),
            "protected" => Ok(Access::Protected),
            other => Err(format!("unknown access level '{}' (expected public or protected)", other)),
        }
    }
}

/// Attributes sent along with a stored object.
///
/// The recognized keys are typed; anything else goes through `extra` and is
/// passed to the server unvalidated. Serialization emits one JSON object with
/// keys in sorted order, so the same attributes always produce the same bytes.
/// A typed field wins over an `extra` entry with the same key.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ObjectAttributes {
    /// Access level; the server picks its own default when unset
    #[serde(default)]
    pub access: Option<Access>,
    /// Override the MIME type detected by the server
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Cache age in seconds (public objects only)
    #[serde(default)]
    pub cache_age: Option<u64>,
    /// URL lifetime in seconds (protected objects only)
    #[serde(default)]
    pub ttl: Option<u64>,
    /// Unrecognized keys, passed through as-is
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ObjectAttributes {
    /// Empty attributes, serialized as `{}`
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_access(mut self, access: Access) -> Self {
        self.access = Some(access);
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_cache_age(mut self, seconds: u64) -> Self {
        self.cache_age = Some(seconds);
        self
    }

    pub fn with_ttl(mut self, seconds: u64) -> Self {
        self.ttl = Some(seconds);
        self
    }

    /// Add a pass-through attribute
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.access.is_none()
            && self.mime_type.is_none()
            && self.cache_age.is_none()
            && self.ttl.is_none()
            && self.extra.is_empty()
    }

    /// Serialize to the JSON string that is both signed and transmitted
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    fn merged(&self) -> Map<String, Value> {
        let mut map = self.extra.clone();
        if let Some(access) = self.access {
            map.insert("access".to_string(), Value::from(access.as_str()));
        }
        if let Some(ref mime_type) = self.mime_type {
            map.insert("mime_type".to_string(), Value::from(mime_type.as_str()));
        }
        if let Some(cache_age) = self.cache_age {
            map.insert("cache_age".to_string(), Value::from(cache_age));
        }
        if let Some(ttl) = self.ttl {
            map.insert("ttl".to_string(), Value::from(ttl));
        }
        map
    }
}

impl Serialize for ObjectAttributes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let merged = self.merged();
        let mut map = serializer.serialize_map(Some(merged.len()))?;
        for (key, value) in &merged {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// A request's signed field set.
///
/// `fields` keeps the order in which values are transmitted; the signature
/// covers only the operation's canonical message, never all fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequest {
    time: i64,
    fields: Vec<(&'static str, String)>,
    signature: String,
}

impl SignedRequest {
    pub fn new(time: i64, fields: Vec<(&'static str, String)>, signature: String) -> Self {
        Self {
            time,
            fields,
            signature,
        }
    }

    pub fn time(&self) -> i64 {
        self.time
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Look up a field value by name
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Fields in transmission order, without the signature
    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (*k, v.as_str()))
    }

    /// Fields followed by the `signature` pair
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields()
            .chain(std::iter::once(("signature", self.signature.as_str())))
    }
}

/// Redirect instructions produced by [`ObjectClient::stream`](crate::om::ObjectClient::stream).
///
/// The embedding server applies these to its own response: 301 with a
/// `Location` header when the object URL was resolved, 500 without one otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub status: StatusCode,
    pub location: Option<ObjectUrl>,
}

impl Redirect {
    pub fn moved_permanently(location: ObjectUrl) -> Self {
        Self {
            status: StatusCode::MOVED_PERMANENTLY,
            location: Some(location),
        }
    }

    pub fn server_error() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            location: None,
        }
    }

    pub fn is_redirect(&self) -> bool {
        self.status.is_redirection() && self.location.is_some()
    }

    /// Build an empty-bodied hyper response.
    ///
    /// A location that is not a valid header value degrades to a 500.
    pub fn into_response(self) -> Response<Empty<Bytes>> {
        let mut response = Response::new(Empty::new());
        match self.location.as_deref().map(HeaderValue::from_str) {
            Some(Ok(value)) => {
                *response.status_mut() = self.status;
                response.headers_mut().insert(LOCATION, value);
            }
            Some(Err(_)) => {
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            }
            None => {
                *response.status_mut() = self.status;
            }
        }
        response
    }
}
