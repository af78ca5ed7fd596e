//! In-process fake object manager server
//!
//! Implements `store.php`, `delete.php`, `url.php` and `object.php` with the
//! same signature checks a real server performs, computed independently of
//! the crate's signer. Protected objects get a `time`/`id`/`signature` URL
//! that answers 401 once `ttl` seconds have passed.

#![allow(dead_code)]

use bytes::Bytes;
use chrono::Utc;
use hmac::{Hmac, Mac};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use sha2::Sha256;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_TTL: i64 = 3600;

struct StoredObject {
    data: Vec<u8>,
    collection: String,
    file_name: String,
    public: bool,
    ttl: i64,
}

struct State {
    secret: Vec<u8>,
    base_url: String,
    objects: Mutex<HashMap<String, StoredObject>>,
    next_id: AtomicU64,
    requests: AtomicUsize,
}

pub struct FakeServer {
    pub base_url: String,
    state: Arc<State>,
}

impl FakeServer {
    /// Bind to an ephemeral port and serve until the test runtime shuts down
    pub async fn start(secret: &str) -> FakeServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}/", addr);

        let state = Arc::new(State {
            secret: secret.as_bytes().to_vec(),
            base_url: base_url.clone(),
            objects: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            requests: AtomicUsize::new(0),
        });

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => continue,
                };
                let state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { Ok::<_, Infallible>(handle(&state, req).await) }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        FakeServer { base_url, state }
    }

    /// Number of HTTP requests received so far
    pub fn request_count(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    pub fn object_count(&self) -> usize {
        self.state.objects.lock().unwrap().len()
    }

    /// Collection and file name recorded for an object
    pub fn object_meta(&self, id: &str) -> Option<(String, String)> {
        self.state
            .objects
            .lock()
            .unwrap()
            .get(id)
            .map(|o| (o.collection.clone(), o.file_name.clone()))
    }
}

/// Accept TCP connections and never answer, holding them open until the
/// returned task is aborted
pub async fn start_silent_server() -> (String, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}/", listener.local_addr().unwrap());
    let handle = tokio::spawn(async move {
        let mut open = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            open.push(stream);
        }
    });
    (base_url, handle)
}

fn hmac_hex(secret: &[u8], message: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).unwrap();
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

fn respond(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}

fn json_error(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    respond(status, serde_json::json!({ "error": message }).to_string())
}

fn form_fields(raw: &[u8]) -> HashMap<String, String> {
    url::form_urlencoded::parse(raw).into_owned().collect()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Minimal multipart/form-data parser: field name -> raw content
pub fn parse_multipart(body: &[u8], boundary: &str) -> HashMap<String, (Vec<u8>, Option<String>)> {
    let delimiter = format!("--{}", boundary).into_bytes();
    let mut parts = HashMap::new();

    let start = match find(body, &delimiter) {
        Some(pos) => pos,
        None => return parts,
    };
    let mut rest = &body[start + delimiter.len()..];

    loop {
        if rest.starts_with(b"--") {
            break;
        }
        rest = rest.strip_prefix(b"\r\n").unwrap_or(rest);
        let next = match find(rest, &delimiter) {
            Some(pos) => pos,
            None => break,
        };
        let part = &rest[..next];
        let part = part.strip_suffix(b"\r\n").unwrap_or(part);

        if let Some(split) = find(part, b"\r\n\r\n") {
            let headers = String::from_utf8_lossy(&part[..split]).into_owned();
            let content = part[split + 4..].to_vec();
            let name = headers
                .split("; name=\"")
                .nth(1)
                .and_then(|r| r.split('"').next())
                .map(str::to_string);
            let file_name = headers
                .split("filename=\"")
                .nth(1)
                .and_then(|r| r.split('"').next())
                .map(str::to_string);
            if let Some(name) = name {
                parts.insert(name, (content, file_name));
            }
        }
        rest = &rest[next + delimiter.len()..];
    }

    parts
}

async fn handle(state: &State, req: Request<Incoming>) -> Response<Full<Bytes>> {
    state.requests.fetch_add(1, Ordering::SeqCst);

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = form_fields(req.uri().query().unwrap_or("").as_bytes());
    let content_type = req
        .headers()
        .get(hyper::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let body = match req.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return json_error(StatusCode::BAD_REQUEST, "unreadable body"),
    };

    match (method, path.as_str()) {
        (Method::POST, "/store.php") => handle_store(state, &content_type, &body),
        (Method::POST, "/delete.php") => handle_delete(state, &form_fields(&body)),
        (Method::GET, "/url.php") => handle_url(state, &query),
        (Method::GET, "/object.php") => handle_object(state, &query),
        _ => json_error(StatusCode::NOT_FOUND, "no such endpoint"),
    }
}

fn handle_store(state: &State, content_type: &str, body: &[u8]) -> Response<Full<Bytes>> {
    let boundary = match content_type.split("boundary=").nth(1) {
        Some(b) => b.trim(),
        None => return json_error(StatusCode::BAD_REQUEST, "not multipart"),
    };
    let parts = parse_multipart(body, boundary);

    let text = |name: &str| {
        parts
            .get(name)
            .map(|(content, _)| String::from_utf8_lossy(content).into_owned())
    };
    let (time, collection, attributes, signature) = match (
        text("time"),
        text("collection"),
        text("attributes"),
        text("signature"),
    ) {
        (Some(t), Some(c), Some(a), Some(s)) => (t, c, a, s),
        _ => return json_error(StatusCode::BAD_REQUEST, "missing fields"),
    };
    let (data, file_name) = match parts.get("file") {
        Some((content, Some(name))) => (content.clone(), name.clone()),
        _ => return json_error(StatusCode::BAD_REQUEST, "missing file"),
    };

    let expected = hmac_hex(
        &state.secret,
        &format!("{}{}{}{}", time, collection, md5_hex(&data), md5_hex(attributes.as_bytes())),
    );
    if expected != signature {
        return json_error(StatusCode::FORBIDDEN, "invalid signature");
    }

    let attributes: serde_json::Value = match serde_json::from_str(&attributes) {
        Ok(serde_json::Value::Object(map)) => serde_json::Value::Object(map),
        _ => return json_error(StatusCode::BAD_REQUEST, "attributes must be an object"),
    };
    let public = attributes.get("access").and_then(|v| v.as_str()) == Some("public");
    let ttl = attributes
        .get("ttl")
        .and_then(|v| v.as_i64())
        .unwrap_or(DEFAULT_TTL);

    let id = format!("{:016x}", state.next_id.fetch_add(1, Ordering::SeqCst));
    state.objects.lock().unwrap().insert(
        id.clone(),
        StoredObject {
            data,
            collection,
            file_name,
            public,
            ttl,
        },
    );

    respond(StatusCode::OK, serde_json::json!({ "object_id": id }).to_string())
}

fn check_object_signature(state: &State, fields: &HashMap<String, String>) -> Option<String> {
    let time = fields.get("time")?;
    let id = fields.get("id")?;
    let signature = fields.get("signature")?;
    if hmac_hex(&state.secret, &format!("{}{}", time, id)) == *signature {
        Some(id.clone())
    } else {
        None
    }
}

fn handle_delete(state: &State, fields: &HashMap<String, String>) -> Response<Full<Bytes>> {
    let id = match check_object_signature(state, fields) {
        Some(id) => id,
        None => return json_error(StatusCode::FORBIDDEN, "invalid signature"),
    };
    match state.objects.lock().unwrap().remove(&id) {
        Some(_) => respond(StatusCode::OK, String::new()),
        None => json_error(StatusCode::NOT_FOUND, "object not found"),
    }
}

fn handle_url(state: &State, query: &HashMap<String, String>) -> Response<Full<Bytes>> {
    let id = match check_object_signature(state, query) {
        Some(id) => id,
        None => return json_error(StatusCode::FORBIDDEN, "invalid signature"),
    };
    let objects = state.objects.lock().unwrap();
    let object = match objects.get(&id) {
        Some(object) => object,
        None => return json_error(StatusCode::NOT_FOUND, "object not found"),
    };

    let url = if object.public {
        format!("{}object.php?id={}", state.base_url, id)
    } else {
        let time = Utc::now().timestamp();
        let signature = hmac_hex(&state.secret, &format!("{}{}", time, id));
        format!(
            "{}object.php?time={}&id={}&signature={}",
            state.base_url, time, id, signature
        )
    };

    respond(StatusCode::OK, serde_json::json!({ "object_url": url }).to_string())
}

fn handle_object(state: &State, query: &HashMap<String, String>) -> Response<Full<Bytes>> {
    let id = match query.get("id") {
        Some(id) => id.clone(),
        None => return json_error(StatusCode::BAD_REQUEST, "missing id"),
    };
    let objects = state.objects.lock().unwrap();
    let object = match objects.get(&id) {
        Some(object) => object,
        None => return json_error(StatusCode::NOT_FOUND, "object not found"),
    };

    if !object.public {
        if check_object_signature(state, query).is_none() {
            return json_error(StatusCode::FORBIDDEN, "invalid signature");
        }
        let issued: i64 = query
            .get("time")
            .and_then(|t| t.parse().ok())
            .unwrap_or(0);
        if Utc::now().timestamp() - issued > object.ttl {
            return json_error(StatusCode::UNAUTHORIZED, "url expired");
        }
    }

    let mut response = Response::new(Full::new(Bytes::from(object.data.clone())));
    *response.status_mut() = StatusCode::OK;
    response
}
