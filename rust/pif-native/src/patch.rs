//! Identity patching on the managed runtime.
//!
//! Every string override is written to a same-named static `String` field.
//! Fields are looked up through an ordered list of owners, `android.os.Build`
//! first and `android.os.Build$VERSION` second; a field absent from both is
//! skipped. Each field is independent: a rejected write is logged and the
//! pass moves on.
//!
//! When provider or signature spoofing is on, the staged dex is loaded and
//! its entry point receives the serialized overrides, so strategies that
//! cannot be expressed as field writes run inside the target.

use std::path::{Path, PathBuf};

use log::{debug, error, info};
use serde_json::Value;

use crate::config::{Overrides, SpoofConfig};
use crate::constants::{DEX_FILE, ENTRY_CLASS, ENTRY_METHOD, ENTRY_SIGNATURE};

/// A class whose static fields may carry an override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldOwner {
    Build,
    BuildVersion,
}

impl FieldOwner {
    /// JNI class name.
    pub fn class_name(self) -> &'static str {
        match self {
            FieldOwner::Build => "android/os/Build",
            FieldOwner::BuildVersion => "android/os/Build$VERSION",
        }
    }
}

/// Owners tried for each field, in order.
pub const FIELD_RESOLVERS: [FieldOwner; 2] = [FieldOwner::Build, FieldOwner::BuildVersion];

/// Result of one static field write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldWrite {
    Written,
    /// The owner has no static `String` field with that name.
    Missing,
    /// The field exists but the write failed.
    Rejected(String),
}

/// Static string field access on the runtime.
pub trait StaticStringFields {
    fn write_static_string(&mut self, owner: FieldOwner, name: &str, value: &str) -> FieldWrite;
}

/// Where the secondary unit lives and how it is entered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryUnit {
    pub dex_path: PathBuf,
    /// Native library search path for the class loader.
    pub library_dir: PathBuf,
    pub entry_class: &'static str,
    pub entry_method: &'static str,
    pub entry_signature: &'static str,
}

impl SecondaryUnit {
    /// The unit the companion stages into `dir`.
    pub fn staged_in(dir: &Path) -> Self {
        SecondaryUnit {
            dex_path: dir.join(DEX_FILE),
            library_dir: dir.to_path_buf(),
            entry_class: ENTRY_CLASS,
            entry_method: ENTRY_METHOD,
            entry_signature: ENTRY_SIGNATURE,
        }
    }
}

/// Errors raised while launching the secondary unit.
#[derive(Debug)]
pub enum PatchError {
    /// A runtime call failed at the named step.
    Runtime { step: &'static str, message: String },
    /// The overrides could not be serialized.
    Serialize(serde_json::Error),
}

impl std::fmt::Display for PatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatchError::Runtime { step, message } => write!(f, "{} failed: {}", step, message),
            PatchError::Serialize(err) => write!(f, "cannot serialize overrides: {}", err),
        }
    }
}

impl std::error::Error for PatchError {}

/// Loads and enters a secondary code unit.
pub trait SecondaryLoader {
    fn launch(
        &mut self,
        unit: &SecondaryUnit,
        document: &str,
        spoof_provider: bool,
        spoof_signature: bool,
    ) -> Result<(), PatchError>;
}

/// Everything the patch pass needs from the runtime.
pub trait IdentityRuntime: StaticStringFields + SecondaryLoader {}

impl<T: StaticStringFields + SecondaryLoader> IdentityRuntime for T {}

/// Per-pass outcome, mostly for logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchReport {
    pub written: Vec<(FieldOwner, String)>,
    pub missing: Vec<String>,
    pub rejected: Vec<String>,
    pub secondary_launched: bool,
}

/// Write one override through the resolvers.
fn write_field<F: StaticStringFields + ?Sized>(
    fields: &mut F,
    name: &str,
    value: &str,
    report: &mut PatchReport,
) {
    for owner in FIELD_RESOLVERS {
        match fields.write_static_string(owner, name, value) {
            FieldWrite::Written => {
                debug!("Set '{}' to '{}'", name, value);
                report.written.push((owner, name.to_string()));
                return;
            }
            FieldWrite::Missing => continue,
            FieldWrite::Rejected(reason) => {
                error!("Couldn't set '{}' on {}: {}", name, owner.class_name(), reason);
                report.rejected.push(name.to_string());
                return;
            }
        }
    }
    report.missing.push(name.to_string());
}

/// Overwrite every string-valued override that names a build field.
pub fn apply_field_overrides<F: StaticStringFields + ?Sized>(
    fields: &mut F,
    overrides: &Overrides,
) -> PatchReport {
    let mut report = PatchReport::default();
    for (name, value) in overrides {
        if let Value::String(value) = value {
            write_field(fields, name, value, &mut report);
        }
    }
    report
}

/// Run the patch pass: field overrides, then the secondary unit.
pub fn apply<R: IdentityRuntime + ?Sized>(
    runtime: &mut R,
    spoof: &SpoofConfig,
    overrides: &Overrides,
    staged_dir: &Path,
) -> PatchReport {
    let mut report = apply_field_overrides(runtime, overrides);
    info!(
        "build fields: {} written, {} missing, {} rejected",
        report.written.len(),
        report.missing.len(),
        report.rejected.len()
    );

    if !spoof.wants_patch() {
        return report;
    }

    let document = match serde_json::to_string(overrides) {
        Ok(doc) => doc,
        Err(e) => {
            error!("{}", PatchError::Serialize(e));
            return report;
        }
    };

    let unit = SecondaryUnit::staged_in(staged_dir);
    match runtime.launch(&unit, &document, spoof.spoof_provider, spoof.spoof_signature) {
        Ok(()) => {
            debug!("{} entered", unit.entry_class);
            report.secondary_launched = true;
        }
        Err(e) => error!("secondary unit: {}", e),
    }
    report
}
