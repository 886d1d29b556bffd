//! Spoofing configuration.
//!
//! The companion stages a JSON object as `pif.json` in the target's data
//! directory. A handful of keys control the module itself; they are pulled
//! out into a typed [`SpoofConfig`]. Everything left over is a field
//! override for `android.os.Build` and is returned separately as
//! [`Overrides`]. A `FINGERPRINT` string expands into the eight build fields
//! it encodes.
//!
//! Capability flags reported by the companion are applied last and always
//! win over the document.

use std::fs;
use std::path::Path;

use log::{debug, error, warn};
use serde_json::{Map, Value};

use crate::fingerprint::Fingerprint;

/// Control keys consumed by the resolver.
pub const KEY_INITIAL_SDK_INT: &str = "DEVICE_INITIAL_SDK_INT";
pub const KEY_SPOOF_PROVIDER: &str = "spoofProvider";
pub const KEY_SPOOF_PROPS: &str = "spoofProps";
pub const KEY_SPOOF_SIGNATURE: &str = "spoofSignature";
pub const KEY_DEBUG: &str = "DEBUG";

/// Keys read by the resolver but kept as field overrides.
pub const KEY_FINGERPRINT: &str = "FINGERPRINT";
pub const KEY_SECURITY_PATCH: &str = "SECURITY_PATCH";
pub const KEY_BUILD_ID: &str = "ID";

/// Ordered field name to value mapping applied to the build classes.
pub type Overrides = Map<String, Value>;

/// Environment facts reported by the companion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilityFlags {
    /// A competing keystore module is installed and active.
    pub tricky_store_detected: bool,
    /// The ROM's OTA certificates include test keys.
    pub test_signed_rom: bool,
}

/// Typed control values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoofConfig {
    pub spoof_provider: bool,
    pub spoof_props: bool,
    pub spoof_signature: bool,
    pub debug: bool,
    pub initial_sdk_int: Option<String>,
    pub security_patch: Option<String>,
    pub build_id: Option<String>,
}

impl Default for SpoofConfig {
    fn default() -> Self {
        SpoofConfig {
            spoof_provider: true,
            spoof_props: true,
            spoof_signature: false,
            debug: false,
            initial_sdk_int: None,
            security_patch: None,
            build_id: None,
        }
    }
}

impl SpoofConfig {
    /// Force the values implied by `flags`.
    pub fn enforce(&mut self, flags: CapabilityFlags) {
        if flags.tricky_store_detected {
            self.spoof_provider = false;
            self.spoof_props = false;
        }
        if flags.test_signed_rom {
            self.spoof_signature = true;
        }
    }

    /// Whether the identity patch pass (field overrides and secondary unit) runs.
    pub fn wants_patch(&self) -> bool {
        self.spoof_provider || self.spoof_signature
    }
}

/// The resolver's output: typed control values plus leftover field overrides.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResolvedConfig {
    pub spoof: SpoofConfig,
    pub overrides: Overrides,
}

/// Errors raised while loading the staged document.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Json(serde_json::Error),
    /// The document parsed but is not a JSON object.
    NotAnObject,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "cannot read configuration: {}", err),
            ConfigError::Json(err) => write!(f, "invalid configuration JSON: {}", err),
            ConfigError::NotAnObject => write!(f, "configuration is not a JSON object"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Json(err)
    }
}

/// Remove `//` line comments and `/* */` block comments outside of strings.
///
/// Comment bytes are replaced with spaces (newlines are kept) so parser
/// error positions still point at the original text.
pub fn strip_comments(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    let mut in_string = false;

    while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            out.push(b);
            if b == b'\\' && i + 1 < bytes.len() {
                out.push(bytes[i + 1]);
                i += 2;
                continue;
            }
            if b == b'"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        match (b, bytes.get(i + 1)) {
            (b'"', _) => {
                in_string = true;
                out.push(b);
                i += 1;
            }
            (b'/', Some(b'/')) => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    out.push(b' ');
                    i += 1;
                }
            }
            (b'/', Some(b'*')) => {
                out.extend_from_slice(b"  ");
                i += 2;
                while i < bytes.len() && !(bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/')) {
                    out.push(if bytes[i] == b'\n' { b'\n' } else { b' ' });
                    i += 1;
                }
                if i < bytes.len() {
                    out.extend_from_slice(b"  ");
                    i += 2;
                }
            }
            _ => {
                out.push(b);
                i += 1;
            }
        }
    }

    // Only ASCII bytes outside strings were replaced, so the output is still UTF-8.
    String::from_utf8(out).unwrap_or_default()
}

/// Parse a configuration document from text.
pub fn parse_document(text: &str) -> Result<Overrides, ConfigError> {
    match serde_json::from_str::<Value>(&strip_comments(text))? {
        Value::Object(map) => Ok(map),
        _ => Err(ConfigError::NotAnObject),
    }
}

/// Load the staged document at `path`.
///
/// A missing file is not an error and yields `Ok(None)`.
pub fn load_document(path: &Path) -> Result<Option<Overrides>, ConfigError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    parse_document(&text).map(Some)
}

/// Consume `key` if it holds a boolean. A wrong-typed value stays in the document.
fn take_bool(doc: &mut Overrides, key: &str) -> Option<bool> {
    match doc.get(key)? {
        Value::Bool(value) => {
            let value = *value;
            doc.remove(key);
            Some(value)
        }
        other => {
            error!("Couldn't parse {} value: expected boolean, got {}", key, other);
            None
        }
    }
}

fn take_sdk_int(doc: &mut Overrides) -> Option<String> {
    match doc.remove(KEY_INITIAL_SDK_INT)? {
        Value::String(value) => Some(value),
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(n.to_string()),
        other => {
            error!("Couldn't parse {} value: {}", KEY_INITIAL_SDK_INT, other);
            None
        }
    }
}

fn peek_string(doc: &Overrides, key: &str) -> Option<String> {
    doc.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Insert the build fields encoded by `FINGERPRINT`, overwriting same-named keys.
fn expand_fingerprint(doc: &mut Overrides) {
    let fingerprint = match doc.get(KEY_FINGERPRINT) {
        Some(Value::String(fp)) => fp.clone(),
        Some(other) => {
            warn!("Ignoring non-string {}: {}", KEY_FINGERPRINT, other);
            return;
        }
        None => return,
    };

    match Fingerprint::parse(&fingerprint) {
        Ok(fp) => {
            for (name, value) in fp.fields() {
                doc.insert(name.to_string(), Value::String(value.to_string()));
            }
        }
        Err(e) => error!("Error parsing fingerprint values! {}", e),
    }
}

/// Split `document` into control values and field overrides, then apply `flags`.
pub fn resolve(document: Option<Overrides>, flags: CapabilityFlags) -> ResolvedConfig {
    let mut spoof = SpoofConfig::default();
    let mut doc = document.unwrap_or_default();

    spoof.initial_sdk_int = take_sdk_int(&mut doc);
    if let Some(value) = take_bool(&mut doc, KEY_SPOOF_PROVIDER) {
        spoof.spoof_provider = value;
    }
    if let Some(value) = take_bool(&mut doc, KEY_SPOOF_PROPS) {
        spoof.spoof_props = value;
    }
    if let Some(value) = take_bool(&mut doc, KEY_SPOOF_SIGNATURE) {
        spoof.spoof_signature = value;
    }
    if let Some(value) = take_bool(&mut doc, KEY_DEBUG) {
        spoof.debug = value;
    }

    expand_fingerprint(&mut doc);

    // Read after the expansion so a fingerprint-derived ID is picked up.
    spoof.security_patch = peek_string(&doc, KEY_SECURITY_PATCH);
    spoof.build_id = peek_string(&doc, KEY_BUILD_ID);

    spoof.enforce(flags);

    debug!(
        "spoofProvider={} spoofProps={} spoofSignature={} DEBUG={} overrides={}",
        spoof.spoof_provider,
        spoof.spoof_props,
        spoof.spoof_signature,
        spoof.debug,
        doc.len()
    );

    ResolvedConfig {
        spoof,
        overrides: doc,
    }
}
