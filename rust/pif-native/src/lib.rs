//! Zygisk module that makes the GMS unstable process report a certified
//! device identity.
//!
//! Two halves share this library:
//!
//! - the module half runs in every freshly forked app process. It engages
//!   only with `com.google.android.gms.unstable`, asks the root companion to
//!   stage its files, patches the build identity on the managed runtime and
//!   rewrites selected system property reads through an inline hook.
//! - the companion half ([`companion`]) runs as root, copies the staged files
//!   into the target's data directory and probes the environment.
//!
//! Everything the host calls enters through [`zygisk`].

pub mod channel;
pub mod companion;
pub mod config;
pub mod constants;
pub mod controller;
pub mod fingerprint;
pub mod hook;
pub mod jvm;
pub mod logging;
pub mod otacerts;
pub mod patch;
pub mod props;
pub mod zygisk;
