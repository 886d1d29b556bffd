//! Fixed paths, names and limits shared by the module and its companion.

use std::time::Duration;

use log::LevelFilter;

// --- Logging ---

/// Tag used for every log line written to logcat.
pub const LOG_TAG: &str = "PIF";

/// Maximum log level. Rewritten property values are logged at `Debug`.
pub const MAX_LOG_LEVEL: LevelFilter = LevelFilter::Debug;

// --- Target process ---

/// Suffix the app data directory must carry for the process to be considered.
pub const GMS_DATA_DIR_SUFFIX: &str = "/com.google.android.gms";

/// The only process name the module engages with.
pub const GMS_UNSTABLE_PROCESS: &str = "com.google.android.gms.unstable";

// --- Module layout (companion side) ---

/// Installed module directory.
pub const MODULE_DIR: &str = "/data/adb/modules/playintegrityfix";

/// System-wide configuration override, checked before the module's own files.
pub const SYSTEM_CONFIG_PATH: &str = "/data/adb/pif.json";

/// User supplied configuration inside the module directory.
pub const CUSTOM_CONFIG_FILE: &str = "custom.pif.json";

/// Configuration shipped with the module.
pub const DEFAULT_CONFIG_FILE: &str = "pif.json";

/// Directory of a competing keystore module whose presence disables provider and prop spoofing.
pub const TRICKY_STORE_DIR: &str = "/data/adb/modules/tricky_store";

/// Marker files that mark a module as inactive.
pub const MODULE_DISABLE_MARKER: &str = "disable";
pub const MODULE_REMOVE_MARKER: &str = "remove";

/// Archive listing the certificates trusted for OTA packages.
pub const OTA_CERTS_PATH: &str = "/system/etc/security/otacerts.zip";

/// Entry name fragment that marks a test-key signed ROM.
pub const TEST_KEY_MARKER: &str = "test";

/// Per-ABI directory holding the ShadowHook library, relative to the module directory.
#[cfg(target_arch = "aarch64")]
pub const HOOK_LIB_SUBDIR: Option<&str> = Some("shadowhook/arm64-v8a");
#[cfg(target_arch = "arm")]
pub const HOOK_LIB_SUBDIR: Option<&str> = Some("shadowhook/armeabi-v7a");
#[cfg(not(any(target_arch = "aarch64", target_arch = "arm")))]
pub const HOOK_LIB_SUBDIR: Option<&str> = None;

// --- Staged files (target directory) ---

/// Name of the staged configuration document.
pub const STAGED_CONFIG_FILE: &str = "pif.json";

/// Name of the secondary code unit.
pub const DEX_FILE: &str = "classes.dex";

/// ShadowHook library as staged next to the configuration.
pub const SHADOWHOOK_LIB: &str = "libshadowhook.so";

// --- IPC ---

/// Upper bound on the target directory path sent to the companion.
pub const MAX_TARGET_DIR_LEN: usize = libc::PATH_MAX as usize;

/// Read/write timeout applied to the companion socket on the module side.
pub const COMPANION_TIMEOUT: Duration = Duration::from_secs(10);

// --- Secondary code unit ---

/// Class loaded from the staged dex.
pub const ENTRY_CLASS: &str = "es.chiteroman.playintegrityfix.EntryPoint";

/// Static method invoked on [`ENTRY_CLASS`].
pub const ENTRY_METHOD: &str = "init";

/// `init(String json, boolean spoofProvider, boolean spoofSignature)`.
pub const ENTRY_SIGNATURE: &str = "(Ljava/lang/String;ZZ)V";

// --- Property hook ---

/// Library and symbol intercepted for property reads.
pub const PROPERTY_LIB: &str = "libc.so";
pub const PROPERTY_READ_SYMBOL: &str = "__system_property_read_callback";
