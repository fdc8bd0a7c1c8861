//! Request/response envelopes carried as frame payloads.
//!
//! Envelopes are UTF-8 JSON with camelCase field names. Binary bodies ride
//! as base64 text so the payload stays text-safe end to end.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::Result;

/// A proxied request, agent → relay (payload of a type-0 frame).
///
/// `url` holds whatever the local client asked for: an absolute-form URL, an
/// origin-form path (the relay then falls back to the `Host` header), or a
/// `host:port` target for CONNECT.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// A proxied response, relay → agent (payload of a type-1 frame).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub status_code: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
}

impl RequestEnvelope {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn from_json(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Attach a binary body, transport-encoded as base64. Empty bodies are
    /// omitted from the wire entirely.
    pub fn set_body(&mut self, body: &[u8]) {
        if !body.is_empty() {
            self.body = Some(BASE64.encode(body));
        }
    }

    /// Decode the base64 body, or an empty buffer when none was sent.
    pub fn body_bytes(&self) -> Result<Vec<u8>> {
        match &self.body {
            Some(b64) => Ok(BASE64.decode(b64)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Header lookup by name, case-insensitive; values keep their case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl ResponseEnvelope {
    pub fn new(status_code: u16, headers: HashMap<String, String>, body: &[u8]) -> Self {
        Self {
            status_code,
            headers,
            body: BASE64.encode(body),
        }
    }

    pub fn from_json(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// A relay-generated answer (outbound failure, CONNECT acknowledgment)
    /// whose body is a literal reason string rather than origin content.
    pub fn synthetic(status_code: u16, reason: &str) -> Self {
        Self::new(status_code, HashMap::new(), reason.as_bytes())
    }

    pub fn body_bytes(&self) -> Result<Vec<u8>> {
        Ok(BASE64.decode(&self.body)?)
    }

    /// Header lookup by name, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}
