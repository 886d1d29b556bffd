//! Root companion: stages files for the target and probes the environment.
//!
//! One request per connection:
//!
//! 1. read the target data directory as a length-prefixed frame,
//! 2. copy the secondary dex, the configuration document and the hook
//!    library into it,
//! 3. probe for an active TrickyStore and for a test-key signed ROM,
//! 4. reply with both flags, one byte each, and close.
//!
//! Every staging step and probe is independent and best-effort: a failure
//! is logged and only its own result is lost. Copies overwrite existing
//! files, so concurrent or repeated requests for the same directory are
//! harmless.

use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};

use crate::channel::{self, ChannelError};
use crate::config::CapabilityFlags;
use crate::constants::{
    CUSTOM_CONFIG_FILE, DEFAULT_CONFIG_FILE, DEX_FILE, HOOK_LIB_SUBDIR, MAX_TARGET_DIR_LEN,
    MODULE_DIR, MODULE_DISABLE_MARKER, MODULE_REMOVE_MARKER, OTA_CERTS_PATH, STAGED_CONFIG_FILE,
    SYSTEM_CONFIG_PATH, TEST_KEY_MARKER, TRICKY_STORE_DIR,
};
use crate::otacerts;

/// Mode of the staged dex: read-only for everyone.
const DEX_MODE: u32 = 0o444;
/// Mode of the staged configuration: world-readable.
const CONFIG_MODE: u32 = 0o644;

/// Where the companion reads its sources from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingLayout {
    pub module_dir: PathBuf,
    /// Configuration that takes precedence over the module's own files.
    pub system_config: PathBuf,
    /// ABI specific hook library directory, if the architecture has one.
    pub hook_lib_dir: Option<PathBuf>,
    pub tricky_store_dir: PathBuf,
    pub ota_certs: PathBuf,
}

impl StagingLayout {
    /// The on-device layout.
    pub fn device() -> Self {
        let module_dir = PathBuf::from(MODULE_DIR);
        StagingLayout {
            hook_lib_dir: HOOK_LIB_SUBDIR.map(|sub| module_dir.join(sub)),
            module_dir,
            system_config: PathBuf::from(SYSTEM_CONFIG_PATH),
            tricky_store_dir: PathBuf::from(TRICKY_STORE_DIR),
            ota_certs: PathBuf::from(OTA_CERTS_PATH),
        }
    }

    /// Configuration candidates, highest precedence first.
    pub fn config_candidates(&self) -> [PathBuf; 3] {
        [
            self.system_config.clone(),
            self.module_dir.join(CUSTOM_CONFIG_FILE),
            self.module_dir.join(DEFAULT_CONFIG_FILE),
        ]
    }
}

/// Errors that end a request before the reply is sent.
#[derive(Debug)]
pub enum StagingError {
    Channel(ChannelError),
    /// The target directory was not valid UTF-8.
    InvalidTargetDir,
}

impl std::fmt::Display for StagingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StagingError::Channel(err) => write!(f, "{}", err),
            StagingError::InvalidTargetDir => write!(f, "target directory is not valid UTF-8"),
        }
    }
}

impl std::error::Error for StagingError {}

impl From<ChannelError> for StagingError {
    fn from(err: ChannelError) -> Self {
        StagingError::Channel(err)
    }
}

/// Copy `src` to `dst`, replacing whatever is there.
fn copy_replace(src: &Path, dst: &Path) -> io::Result<u64> {
    // An earlier read-only copy would make the truncating open fail.
    match fs::remove_file(dst) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    fs::copy(src, dst)
}

fn copy_with_mode(src: &Path, dst: &Path, mode: u32) -> io::Result<()> {
    copy_replace(src, dst)?;
    fs::set_permissions(dst, fs::Permissions::from_mode(mode))
}

/// Copy the secondary dex. Returns whether it was staged.
pub fn stage_dex(layout: &StagingLayout, target: &Path) -> io::Result<bool> {
    let src = layout.module_dir.join(DEX_FILE);
    if !src.exists() {
        return Ok(false);
    }
    copy_with_mode(&src, &target.join(DEX_FILE), DEX_MODE)?;
    Ok(true)
}

/// Copy the first existing configuration candidate. Returns the source used.
pub fn stage_config(layout: &StagingLayout, target: &Path) -> io::Result<Option<PathBuf>> {
    let Some(src) = layout
        .config_candidates()
        .into_iter()
        .find(|candidate| candidate.exists())
    else {
        return Ok(None);
    };
    copy_with_mode(&src, &target.join(STAGED_CONFIG_FILE), CONFIG_MODE)?;
    Ok(Some(src))
}

/// Copy every regular file of the hook library directory. Returns how many were copied.
pub fn stage_hook_libs(layout: &StagingLayout, target: &Path) -> io::Result<usize> {
    let Some(dir) = layout.hook_lib_dir.as_deref() else {
        return Ok(0);
    };
    if !dir.exists() {
        return Ok(0);
    }

    let mut copied = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        match copy_replace(&entry.path(), &target.join(entry.file_name())) {
            Ok(_) => copied += 1,
            Err(e) => warn!("cannot copy {}: {}", entry.path().display(), e),
        }
    }
    Ok(copied)
}

/// TrickyStore is installed and neither disabled nor pending removal.
pub fn tricky_store_active(layout: &StagingLayout) -> bool {
    let dir = &layout.tricky_store_dir;
    dir.exists()
        && !dir.join(MODULE_DISABLE_MARKER).exists()
        && !dir.join(MODULE_REMOVE_MARKER).exists()
}

/// The OTA certificate archive lists a test key.
pub fn test_signed_rom(layout: &StagingLayout) -> bool {
    match otacerts::has_entry_containing(&layout.ota_certs, TEST_KEY_MARKER) {
        Ok(found) => found,
        Err(e) => {
            warn!("cannot list {}: {}", layout.ota_certs.display(), e);
            false
        }
    }
}

/// Run every staging step for `target`, logging failures.
pub fn stage_all(layout: &StagingLayout, target: &Path) {
    match stage_dex(layout, target) {
        Ok(true) => debug!("[ROOT] staged {}", DEX_FILE),
        Ok(false) => debug!("[ROOT] no {} in module", DEX_FILE),
        Err(e) => error!("[ROOT] staging {} failed: {}", DEX_FILE, e),
    }

    match stage_config(layout, target) {
        Ok(Some(src)) => debug!("[ROOT] staged config from {}", src.display()),
        Ok(None) => warn!("[ROOT] no configuration file found"),
        Err(e) => error!("[ROOT] staging config failed: {}", e),
    }

    match stage_hook_libs(layout, target) {
        Ok(n) => debug!("[ROOT] staged {} hook libraries", n),
        Err(e) => error!("[ROOT] staging hook libraries failed: {}", e),
    }
}

/// Probe both capability flags.
pub fn probe(layout: &StagingLayout) -> CapabilityFlags {
    CapabilityFlags {
        tricky_store_detected: tricky_store_active(layout),
        test_signed_rom: test_signed_rom(layout),
    }
}

/// Serve one request on `stream`.
pub fn handle_request<S: Read + Write + ?Sized>(
    stream: &mut S,
    layout: &StagingLayout,
) -> Result<CapabilityFlags, StagingError> {
    let raw = channel::read_frame(stream, MAX_TARGET_DIR_LEN)?;
    let dir = String::from_utf8(raw).map_err(|_| StagingError::InvalidTargetDir)?;
    info!("[ROOT] GMS dir: {}", dir);

    stage_all(layout, Path::new(&dir));

    let flags = probe(layout);
    channel::write_bool(stream, flags.tricky_store_detected)?;
    channel::write_bool(stream, flags.test_signed_rom)?;
    Ok(flags)
}

/// Serve a connection handed over by the host, then close it.
pub fn serve(mut stream: UnixStream, layout: &StagingLayout) {
    match handle_request(&mut stream, layout) {
        Ok(flags) => debug!(
            "[ROOT] replied trickyStore={} testSignedRom={}",
            flags.tricky_store_detected, flags.test_signed_rom
        ),
        Err(e) => error!("[ROOT] request failed: {}", e),
    }
}
