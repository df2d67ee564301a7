//! `.vv` connection descriptors consumed by `remote-viewer`.
//!
//! The format is INI-like: a `[virt-viewer]` section followed by one
//! `key=value` pair per line. Multi-line values are not supported by the
//! viewer's parser, so the CA certificate is flattened with literal `\n`
//! escapes.

use crate::error::{AppError, AppResult};
use serde_json::Value;
use std::collections::BTreeMap;

pub const SECTION_HEADER: &str = "[virt-viewer]";

const DEFAULT_TYPE: &str = "spice";
const DEFAULT_DELETE_THIS_FILE: &str = "1";
const DEFAULT_TOGGLE_FULLSCREEN: &str = "shift+f11";
const DEFAULT_RELEASE_CURSOR: &str = "shift+f12";

/// One SPICE connection target.
///
/// Known keys are explicit fields; anything else the cluster returns is kept
/// in `extra` and emitted after them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VvDescriptor {
    pub kind: Option<String>,
    pub proxy: Option<String>,
    pub host: Option<String>,
    pub port: Option<String>,
    pub tls_port: Option<String>,
    pub password: Option<String>,
    pub title: Option<String>,
    pub host_subject: Option<String>,
    pub secure_attention: Option<String>,
    pub release_cursor: Option<String>,
    pub toggle_fullscreen: Option<String>,
    pub delete_this_file: Option<String>,
    pub ca: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl VvDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&mut self, key: &str) -> Option<&mut Option<String>> {
        match key {
            "type" => Some(&mut self.kind),
            "proxy" => Some(&mut self.proxy),
            "host" => Some(&mut self.host),
            "port" => Some(&mut self.port),
            "tls-port" => Some(&mut self.tls_port),
            "password" => Some(&mut self.password),
            "title" => Some(&mut self.title),
            "host-subject" => Some(&mut self.host_subject),
            "secure-attention" => Some(&mut self.secure_attention),
            "release-cursor" => Some(&mut self.release_cursor),
            "toggle-fullscreen" => Some(&mut self.toggle_fullscreen),
            "delete-this-file" => Some(&mut self.delete_this_file),
            "ca" => Some(&mut self.ca),
            _ => None,
        }
    }

    /// Set a field by its on-disk key name.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.slot(key) {
            Some(slot) => *slot = Some(value),
            None => {
                self.extra.insert(key.to_string(), value);
            }
        }
    }

    /// Look up a field by its on-disk key name.
    pub fn get(&self, key: &str) -> Option<&str> {
        let known = match key {
            "type" => &self.kind,
            "proxy" => &self.proxy,
            "host" => &self.host,
            "port" => &self.port,
            "tls-port" => &self.tls_port,
            "password" => &self.password,
            "title" => &self.title,
            "host-subject" => &self.host_subject,
            "secure-attention" => &self.secure_attention,
            "release-cursor" => &self.release_cursor,
            "toggle-fullscreen" => &self.toggle_fullscreen,
            "delete-this-file" => &self.delete_this_file,
            "ca" => &self.ca,
            _ => return self.extra.get(key).map(String::as_str),
        };
        known.as_deref()
    }

    /// Build a descriptor from the `data` object of a `spiceproxy` response.
    ///
    /// Scalars are stringified; `null` values are dropped. The one-time
    /// credential may arrive as either `password` or `ticket`; both land in
    /// `password`.
    pub fn from_proxy_response(data: &Value) -> AppResult<Self> {
        let map = data
            .as_object()
            .ok_or_else(|| AppError::Format("spiceproxy response is not an object".into()))?;

        let mut descriptor = Self::new();
        for (key, value) in map {
            let Some(text) = scalar_to_string(value) else {
                continue;
            };
            if key == "ticket" {
                continue;
            }
            descriptor.set(key, text);
        }

        if is_blank(&descriptor.password) {
            descriptor.password = map.get("ticket").and_then(scalar_to_string).filter(|t| !t.is_empty());
        }

        Ok(descriptor)
    }

    /// Encoded descriptor text.
    pub fn encode(&self) -> String {
        encode(self)
    }

    fn known_fields(&self) -> [(&'static str, &Option<String>); 12] {
        [
            ("type", &self.kind),
            ("proxy", &self.proxy),
            ("host", &self.host),
            ("port", &self.port),
            ("tls-port", &self.tls_port),
            ("password", &self.password),
            ("title", &self.title),
            ("host-subject", &self.host_subject),
            ("secure-attention", &self.secure_attention),
            ("release-cursor", &self.release_cursor),
            ("toggle-fullscreen", &self.toggle_fullscreen),
            ("delete-this-file", &self.delete_this_file),
        ]
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, str::is_empty)
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

/// Render a descriptor as `.vv` text.
///
/// Defaults for `type`, `delete-this-file`, `toggle-fullscreen` and
/// `release-cursor` come first when the descriptor leaves them unset. `ca`
/// is always the last line, with line breaks escaped as `\n`.
pub fn encode(descriptor: &VvDescriptor) -> String {
    let mut out = String::with_capacity(512);
    out.push_str(SECTION_HEADER);
    out.push('\n');

    let defaults = [
        (&descriptor.kind, "type", DEFAULT_TYPE),
        (&descriptor.delete_this_file, "delete-this-file", DEFAULT_DELETE_THIS_FILE),
        (&descriptor.toggle_fullscreen, "toggle-fullscreen", DEFAULT_TOGGLE_FULLSCREEN),
        (&descriptor.release_cursor, "release-cursor", DEFAULT_RELEASE_CURSOR),
    ];
    for (value, key, default) in defaults {
        if is_blank(value) {
            push_line(&mut out, key, default);
        }
    }

    for (key, value) in descriptor.known_fields() {
        if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
            push_line(&mut out, key, value);
        }
    }

    for (key, value) in &descriptor.extra {
        if !value.is_empty() {
            push_line(&mut out, key, value);
        }
    }

    if let Some(ca) = descriptor.ca.as_deref().filter(|v| !v.is_empty()) {
        let flat = ca.replace("\r\n", "\n").replace('\n', "\\n");
        push_line(&mut out, "ca", &flat);
    }

    out
}

fn push_line(out: &mut String, key: &str, value: &str) {
    out.push_str(key);
    out.push('=');
    out.push_str(value);
    out.push('\n');
}

/// Parse `.vv` text.
///
/// Each line is split on its first `=`; lines without one (including the
/// section header) are ignored and a repeated key keeps its last value.
/// Escaped `\n` sequences in `ca` are left as they are.
pub fn decode(text: &str) -> VvDescriptor {
    let mut descriptor = VvDescriptor::new();
    for line in text.lines() {
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            descriptor.set(key, value.trim());
        }
    }
    descriptor
}
