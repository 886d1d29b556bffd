//! Property value rewrite rules.
//!
//! Applied to every value delivered through the intercepted
//! `__system_property_read_callback`. The first matching rule wins.

use std::borrow::Cow;

use crate::config::SpoofConfig;

/// Values substituted by suffix rules. Captured once, before the hook goes live.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropRewriter {
    initial_sdk_int: Option<String>,
    security_patch: Option<String>,
    build_id: Option<String>,
}

impl PropRewriter {
    pub fn new(
        initial_sdk_int: Option<String>,
        security_patch: Option<String>,
        build_id: Option<String>,
    ) -> Self {
        // An empty override means "not configured".
        let non_empty = |v: Option<String>| v.filter(|s| !s.is_empty());
        PropRewriter {
            initial_sdk_int: non_empty(initial_sdk_int),
            security_patch: non_empty(security_patch),
            build_id: non_empty(build_id),
        }
    }

    pub fn from_config(config: &SpoofConfig) -> Self {
        Self::new(
            config.initial_sdk_int.clone(),
            config.security_patch.clone(),
            config.build_id.clone(),
        )
    }

    /// The value `name` should report instead of `value`, if any.
    pub fn substitute(&self, name: &str) -> Option<&str> {
        match name {
            "init.svc.adbd" => Some("stopped"),
            "sys.usb.state" => Some("mtp"),
            _ if name.ends_with("api_level") => self.initial_sdk_int.as_deref(),
            _ if name.ends_with(".security_patch") => self.security_patch.as_deref(),
            _ if name.ends_with(".build.id") => self.build_id.as_deref(),
            _ => None,
        }
    }

    /// Rewrite `value` for property `name`.
    pub fn rewrite<'a>(&'a self, name: &str, value: &'a str) -> Cow<'a, str> {
        match self.substitute(name) {
            Some(replacement) => Cow::Borrowed(replacement),
            None => Cow::Borrowed(value),
        }
    }
}
