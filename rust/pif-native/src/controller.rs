//! Specialization lifecycle.
//!
//! ```text
//! Unengaged ──identity ok──▶ IdentityChecked ──▶ Negotiating ──▶ Configured
//!     │                                                             │
//!     │ not the target                          post specialize     ▼
//!     └──────────────────────────▶ Terminal ◀──────────────── HookDecision
//! ```
//!
//! `pre_app_specialize` runs in the freshly forked child before any app code.
//! It decides whether this is the GMS unstable process, fetches capability
//! flags from the companion (which stages the target's files on the way)
//! and records them. `post_app_specialize` runs right before app code starts:
//! it resolves the staged configuration, runs the identity patch pass when
//! provider or signature spoofing is on, and arms the property hook when
//! prop spoofing is on. Anything that leaves the module with nothing to do
//! unloads it.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};

use crate::channel::{self, ChannelError};
use crate::config::{self, CapabilityFlags, ResolvedConfig, SpoofConfig};
use crate::constants::{GMS_DATA_DIR_SUFFIX, GMS_UNSTABLE_PROCESS, STAGED_CONFIG_FILE};
use crate::hook::PropertyHook;
use crate::patch::{self, IdentityRuntime, PatchReport};
use crate::props::PropRewriter;

/// Options the module can request from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleOption {
    /// Revert the root mount namespace changes for this process.
    ForceDenylistUnmount,
    /// Unload the module library once the callback returns.
    DlcloseModuleLibrary,
}

/// The host framework as seen by the controller.
pub trait ModuleHost {
    type Channel: Read + Write;

    /// Open a connection to this module's root companion.
    fn connect_companion(&mut self) -> std::io::Result<Self::Channel>;

    fn set_option(&mut self, option: ModuleOption);
}

/// Lazily read specialization arguments. Each accessor returns `None` when the
/// value is absent or unreadable.
pub trait SpecializeArgs {
    fn app_data_dir(&mut self) -> Option<String>;
    fn nice_name(&mut self) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Unengaged,
    IdentityChecked,
    Negotiating,
    Configured,
    HookDecision,
    Terminal,
}

/// What `post_app_specialize` did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostOutcome {
    pub resolved: Option<ResolvedConfig>,
    pub patch: Option<PatchReport>,
    pub hook_armed: bool,
}

#[derive(Debug)]
pub struct Controller {
    stage: Stage,
    target_dir: Option<PathBuf>,
    capabilities: CapabilityFlags,
    spoof: SpoofConfig,
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

/// Exchange the target directory for the companion's capability flags.
pub fn negotiate<C: Read + Write + ?Sized>(
    channel: &mut C,
    target_dir: &str,
) -> Result<CapabilityFlags, ChannelError> {
    channel::write_frame(channel, target_dir.as_bytes())?;
    let tricky_store_detected = channel::read_bool(channel)?;
    let test_signed_rom = channel::read_bool(channel)?;
    Ok(CapabilityFlags {
        tricky_store_detected,
        test_signed_rom,
    })
}

impl Controller {
    pub fn new() -> Self {
        Controller {
            stage: Stage::Unengaged,
            target_dir: None,
            capabilities: CapabilityFlags::default(),
            spoof: SpoofConfig::default(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Capability flags received from the companion.
    pub fn capabilities(&self) -> CapabilityFlags {
        self.capabilities
    }

    /// Control values after capability forcing, before the document is read.
    pub fn spoof(&self) -> &SpoofConfig {
        &self.spoof
    }

    /// Whether this process is the target and post specialization work is pending.
    pub fn is_engaged(&self) -> bool {
        self.stage == Stage::Configured && self.target_dir.is_some()
    }

    fn disengage<H: ModuleHost + ?Sized>(&mut self, host: &mut H) {
        debug!("dlclose zygisk lib");
        host.set_option(ModuleOption::DlcloseModuleLibrary);
        self.target_dir = None;
        self.stage = Stage::Terminal;
    }

    /// Identity check and companion negotiation.
    pub fn pre_app_specialize<H: ModuleHost + ?Sized>(
        &mut self,
        host: &mut H,
        args: Option<&mut dyn SpecializeArgs>,
    ) -> Stage {
        let Some(args) = args else {
            self.disengage(host);
            return self.stage;
        };

        let Some(dir) = args.app_data_dir() else {
            self.disengage(host);
            return self.stage;
        };
        if !dir.ends_with(GMS_DATA_DIR_SUFFIX) {
            self.disengage(host);
            return self.stage;
        }

        // Every GMS process gets the root mounts reverted, target or not.
        host.set_option(ModuleOption::ForceDenylistUnmount);

        match args.nice_name() {
            Some(name) if name == GMS_UNSTABLE_PROCESS => {}
            _ => {
                self.disengage(host);
                return self.stage;
            }
        }
        self.stage = Stage::IdentityChecked;

        self.stage = Stage::Negotiating;
        let flags = match host.connect_companion() {
            Ok(mut conn) => negotiate(&mut conn, &dir).unwrap_or_else(|e| {
                error!("companion exchange failed: {}", e);
                CapabilityFlags::default()
            }),
            Err(e) => {
                error!("cannot connect to companion: {}", e);
                CapabilityFlags::default()
            }
        };

        if flags.tricky_store_detected {
            info!("TrickyStore module detected!");
        }
        if flags.test_signed_rom {
            info!("--- ROM IS SIGNED WITH TEST KEYS ---");
        }
        self.capabilities = flags;
        self.spoof.enforce(flags);
        self.target_dir = Some(PathBuf::from(dir));
        self.stage = Stage::Configured;
        self.stage
    }

    /// Resolve configuration, patch identity, decide on the property hook.
    pub fn post_app_specialize<H, P>(
        &mut self,
        host: &mut H,
        runtime: Option<&mut dyn IdentityRuntime>,
        hook: &mut P,
    ) -> PostOutcome
    where
        H: ModuleHost + ?Sized,
        P: PropertyHook + ?Sized,
    {
        let mut outcome = PostOutcome::default();
        if !self.is_engaged() {
            return outcome;
        }
        let Some(dir) = self.target_dir.take() else {
            return outcome;
        };

        let resolved = resolve_staged(&dir, self.capabilities);
        self.spoof = resolved.spoof.clone();

        if resolved.spoof.wants_patch() {
            match runtime {
                Some(runtime) => {
                    outcome.patch = Some(patch::apply(
                        runtime,
                        &resolved.spoof,
                        &resolved.overrides,
                        &dir,
                    ));
                }
                None => error!("runtime unavailable, identity patch skipped"),
            }
        } else {
            debug!("Dex file won't be injected due spoofProvider and spoofSignature are false");
        }

        self.stage = Stage::HookDecision;
        if resolved.spoof.spoof_props {
            let rewriter = PropRewriter::from_config(&resolved.spoof);
            match hook.arm(&dir, rewriter, resolved.spoof.debug) {
                Ok(()) => {
                    outcome.hook_armed = true;
                    self.stage = Stage::Terminal;
                }
                Err(e) => {
                    error!("hook installation failed: {}", e);
                    self.disengage(host);
                }
            }
        } else {
            self.disengage(host);
        }

        outcome.resolved = Some(resolved);
        outcome
    }

    /// System server is never a target.
    pub fn pre_server_specialize<H: ModuleHost + ?Sized>(&mut self, host: &mut H) {
        self.disengage(host);
    }
}

/// Load `pif.json` from `dir` and resolve it; a broken document counts as absent.
fn resolve_staged(dir: &Path, flags: CapabilityFlags) -> ResolvedConfig {
    let path = dir.join(STAGED_CONFIG_FILE);
    let document = match config::load_document(&path) {
        Ok(Some(doc)) => Some(doc),
        Ok(None) => {
            warn!("{} not staged, using defaults", path.display());
            None
        }
        Err(e) => {
            error!("{}: {}", path.display(), e);
            None
        }
    };
    config::resolve(document, flags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::companion::{self, StagingLayout};
    use crate::hook::HookError;
    use crate::patch::fake::FakeRuntime;
    use crate::patch::FieldOwner;
    use std::fs;
    use std::io;
    use std::os::unix::net::UnixStream;
    use std::thread;
    use tempfile::TempDir;

    /// Host whose companion is a real staging service on a socket pair.
    struct FakeHost {
        layout: Option<StagingLayout>,
        connects: usize,
        options: Vec<ModuleOption>,
    }

    impl FakeHost {
        fn new(layout: Option<StagingLayout>) -> Self {
            FakeHost {
                layout,
                connects: 0,
                options: Vec::new(),
            }
        }

        fn dlclosed(&self) -> bool {
            self.options.contains(&ModuleOption::DlcloseModuleLibrary)
        }
    }

    impl ModuleHost for FakeHost {
        type Channel = UnixStream;

        fn connect_companion(&mut self) -> io::Result<UnixStream> {
            self.connects += 1;
            let layout = self
                .layout
                .clone()
                .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "no companion"))?;
            let (client, server) = UnixStream::pair()?;
            thread::spawn(move || companion::serve(server, &layout));
            Ok(client)
        }

        fn set_option(&mut self, option: ModuleOption) {
            self.options.push(option);
        }
    }

    struct Args {
        dir: Option<String>,
        name: Option<String>,
        name_reads: usize,
    }

    impl Args {
        fn new(dir: &str, name: &str) -> Self {
            Args {
                dir: Some(dir.to_string()),
                name: Some(name.to_string()),
                name_reads: 0,
            }
        }
    }

    impl SpecializeArgs for Args {
        fn app_data_dir(&mut self) -> Option<String> {
            self.dir.clone()
        }

        fn nice_name(&mut self) -> Option<String> {
            self.name_reads += 1;
            self.name.clone()
        }
    }

    #[derive(Default)]
    struct FakeHook {
        armed: Vec<(PathBuf, PropRewriter, bool)>,
        fail: bool,
    }

    impl PropertyHook for FakeHook {
        fn arm(&mut self, staged_dir: &Path, rewriter: PropRewriter, debug: bool) -> Result<(), HookError> {
            if self.fail {
                return Err(HookError::Load("no engine".into()));
            }
            self.armed.push((staged_dir.to_path_buf(), rewriter, debug));
            Ok(())
        }
    }

    /// Module tree plus a GMS data directory under a temp root.
    struct Device {
        _root: TempDir,
        layout: StagingLayout,
        gms_dir: PathBuf,
    }

    fn device(config: Option<&str>) -> Device {
        let root = tempfile::tempdir().unwrap();
        let module_dir = root.path().join("adb/modules/playintegrityfix");
        fs::create_dir_all(&module_dir).unwrap();
        if let Some(config) = config {
            fs::write(module_dir.join("pif.json"), config).unwrap();
        }
        let gms_dir = root.path().join("data/user/0/com.google.android.gms");
        fs::create_dir_all(&gms_dir).unwrap();
        let layout = StagingLayout {
            hook_lib_dir: None,
            system_config: root.path().join("adb/pif.json"),
            tricky_store_dir: root.path().join("adb/modules/tricky_store"),
            ota_certs: root.path().join("otacerts.zip"),
            module_dir,
        };
        Device {
            _root: root,
            layout,
            gms_dir,
        }
    }

    fn gms_args(device: &Device) -> Args {
        Args::new(device.gms_dir.to_str().unwrap(), GMS_UNSTABLE_PROCESS)
    }

    #[test]
    fn test_missing_args_disengage() {
        let mut host = FakeHost::new(None);
        let mut controller = Controller::new();
        assert_eq!(controller.pre_app_specialize(&mut host, None), Stage::Terminal);
        assert!(host.dlclosed());
        assert_eq!(host.connects, 0);
    }

    #[test]
    fn test_unreadable_dir_disengages() {
        let mut host = FakeHost::new(None);
        let mut args = Args {
            dir: None,
            name: Some(GMS_UNSTABLE_PROCESS.into()),
            name_reads: 0,
        };
        let mut controller = Controller::new();
        controller.pre_app_specialize(&mut host, Some(&mut args));
        assert_eq!(host.options, vec![ModuleOption::DlcloseModuleLibrary]);
        assert_eq!(args.name_reads, 0);
    }

    #[test]
    fn test_other_app_disengages_before_reading_name() {
        let mut host = FakeHost::new(None);
        let mut args = Args::new("/data/user/0/com.android.vending", "com.android.vending");
        let mut controller = Controller::new();
        assert_eq!(
            controller.pre_app_specialize(&mut host, Some(&mut args)),
            Stage::Terminal
        );
        assert_eq!(host.options, vec![ModuleOption::DlcloseModuleLibrary]);
        assert_eq!(args.name_reads, 0);
        assert_eq!(host.connects, 0);
    }

    #[test]
    fn test_non_unstable_gms_process_disengages_without_ipc() {
        let dev = device(Some("{}"));
        let mut host = FakeHost::new(Some(dev.layout.clone()));
        let mut args = Args::new(dev.gms_dir.to_str().unwrap(), "com.google.android.gms.persistent");
        let mut controller = Controller::new();

        assert_eq!(
            controller.pre_app_specialize(&mut host, Some(&mut args)),
            Stage::Terminal
        );
        assert_eq!(
            host.options,
            vec![
                ModuleOption::ForceDenylistUnmount,
                ModuleOption::DlcloseModuleLibrary
            ]
        );
        assert_eq!(host.connects, 0);
        // Nothing was staged.
        assert_eq!(fs::read_dir(&dev.gms_dir).unwrap().count(), 0);

        let mut rt = FakeRuntime::android();
        let mut hook = FakeHook::default();
        let outcome = controller.post_app_specialize(&mut host, Some(&mut rt), &mut hook);
        assert_eq!(outcome, PostOutcome::default());
        assert!(hook.armed.is_empty());
    }

    #[test]
    fn test_unstable_gms_end_to_end() {
        let dev = device(Some(
            r#"{"spoofProps":true,"spoofProvider":false,"FINGERPRINT":"brandX/productY/deviceZ:13/IDQ1:2024:userdebug:release-keys"}"#,
        ));
        let mut host = FakeHost::new(Some(dev.layout.clone()));
        let mut args = gms_args(&dev);
        let mut controller = Controller::new();

        assert_eq!(
            controller.pre_app_specialize(&mut host, Some(&mut args)),
            Stage::Configured
        );
        assert_eq!(host.connects, 1);
        assert_eq!(controller.capabilities(), CapabilityFlags::default());
        assert!(dev.gms_dir.join("pif.json").exists());
        assert!(controller.is_engaged());

        let mut rt = FakeRuntime::android();
        let mut hook = FakeHook::default();
        let outcome = controller.post_app_specialize(&mut host, Some(&mut rt), &mut hook);

        let resolved = outcome.resolved.unwrap();
        assert!(resolved.spoof.spoof_props);
        assert!(!resolved.spoof.spoof_provider);
        assert!(!resolved.spoof.spoof_signature);
        let o = &resolved.overrides;
        assert_eq!(o["BRAND"], "brandX");
        assert_eq!(o["PRODUCT"], "productY");
        assert_eq!(o["DEVICE"], "deviceZ");
        assert_eq!(o["RELEASE"], "13");
        assert_eq!(o["ID"], "IDQ1");
        assert_eq!(o["INCREMENTAL"], "2024");
        assert_eq!(o["TYPE"], "userdebug");
        assert_eq!(o["TAGS"], "release-keys");

        // No provider or signature spoofing: no patch pass at all.
        assert!(outcome.patch.is_none());
        assert_eq!(rt.value(FieldOwner::Build, "BRAND"), Some(""));
        assert!(rt.launches.is_empty());

        assert!(outcome.hook_armed);
        assert_eq!(hook.armed.len(), 1);
        let (dir, rewriter, debug) = &hook.armed[0];
        assert_eq!(dir, &dev.gms_dir);
        assert_eq!(rewriter.substitute("ro.build.id"), Some("IDQ1"));
        assert!(!debug);

        assert!(!host.dlclosed());
        assert_eq!(controller.stage(), Stage::Terminal);
    }

    #[test]
    fn test_patch_pass_runs_with_provider_spoofing() {
        let dev = device(Some(r#"{"MODEL":"Pixel 8","SECURITY_PATCH":"2024-01-05"}"#));
        fs::write(dev.layout.module_dir.join("classes.dex"), "dex").unwrap();
        let mut host = FakeHost::new(Some(dev.layout.clone()));
        let mut controller = Controller::new();
        controller.pre_app_specialize(&mut host, Some(&mut gms_args(&dev)));

        let mut rt = FakeRuntime::android();
        let mut hook = FakeHook::default();
        let outcome = controller.post_app_specialize(&mut host, Some(&mut rt), &mut hook);

        let report = outcome.patch.unwrap();
        assert!(report.secondary_launched);
        assert_eq!(rt.value(FieldOwner::Build, "MODEL"), Some("Pixel 8"));
        assert_eq!(
            rt.value(FieldOwner::BuildVersion, "SECURITY_PATCH"),
            Some("2024-01-05")
        );
        assert!(dev.gms_dir.join("classes.dex").exists());
        let (unit, _, provider, signature) = &rt.launches[0];
        assert_eq!(unit.dex_path, dev.gms_dir.join("classes.dex"));
        assert!(*provider);
        assert!(!*signature);
        assert_eq!(
            hook.armed[0].1.substitute("ro.build.version.security_patch"),
            Some("2024-01-05")
        );
    }

    #[test]
    fn test_tricky_store_forces_spoofing_off_and_unloads() {
        let dev = device(Some(r#"{"spoofProvider":true,"spoofProps":true}"#));
        fs::create_dir_all(&dev.layout.tricky_store_dir).unwrap();
        let mut host = FakeHost::new(Some(dev.layout.clone()));
        let mut controller = Controller::new();
        controller.pre_app_specialize(&mut host, Some(&mut gms_args(&dev)));

        assert!(controller.capabilities().tricky_store_detected);
        assert!(!controller.spoof().spoof_provider);
        assert!(!controller.spoof().spoof_props);

        let mut rt = FakeRuntime::android();
        let mut hook = FakeHook::default();
        let outcome = controller.post_app_specialize(&mut host, Some(&mut rt), &mut hook);
        let resolved = outcome.resolved.unwrap();
        assert!(!resolved.spoof.spoof_provider);
        assert!(!resolved.spoof.spoof_props);
        assert!(outcome.patch.is_none());
        assert!(!outcome.hook_armed);
        assert!(hook.armed.is_empty());
        assert!(host.dlclosed());
    }

    #[test]
    fn test_test_signed_rom_forces_signature_spoofing() {
        let dev = device(Some(r#"{"spoofSignature":false,"spoofProvider":false}"#));
        fs::write(
            &dev.layout.ota_certs,
            crate::otacerts::build_zip(&["testkey.x509.pem"]),
        )
        .unwrap();
        let mut host = FakeHost::new(Some(dev.layout.clone()));
        let mut controller = Controller::new();
        controller.pre_app_specialize(&mut host, Some(&mut gms_args(&dev)));
        assert!(controller.capabilities().test_signed_rom);

        let mut rt = FakeRuntime::android();
        let mut hook = FakeHook::default();
        let outcome = controller.post_app_specialize(&mut host, Some(&mut rt), &mut hook);
        assert!(outcome.resolved.unwrap().spoof.spoof_signature);
        assert!(outcome.patch.is_some());
        assert!(rt.launches[0].3);
    }

    #[test]
    fn test_companion_unreachable_uses_defaults() {
        let dev = device(None);
        let mut host = FakeHost::new(None);
        let mut controller = Controller::new();
        assert_eq!(
            controller.pre_app_specialize(&mut host, Some(&mut gms_args(&dev))),
            Stage::Configured
        );
        assert_eq!(host.connects, 1);
        assert_eq!(controller.capabilities(), CapabilityFlags::default());

        let mut rt = FakeRuntime::android();
        let mut hook = FakeHook::default();
        let outcome = controller.post_app_specialize(&mut host, Some(&mut rt), &mut hook);
        assert_eq!(outcome.resolved.unwrap().spoof, SpoofConfig::default());
        assert!(outcome.hook_armed);
    }

    #[test]
    fn test_companion_hangs_up_early() {
        let (mut client, mut server) = UnixStream::pair().unwrap();
        let handle = thread::spawn(move || {
            let _ = channel::read_frame(&mut server, 16);
            channel::write_bool(&mut server, true).unwrap();
            // Close before the second flag.
        });
        let result = negotiate(&mut client, "/data/user/0/com.google.android.gms");
        handle.join().unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn test_hook_failure_unloads() {
        let dev = device(Some("{}"));
        let mut host = FakeHost::new(Some(dev.layout.clone()));
        let mut controller = Controller::new();
        controller.pre_app_specialize(&mut host, Some(&mut gms_args(&dev)));

        let mut rt = FakeRuntime::android();
        let mut hook = FakeHook {
            fail: true,
            ..FakeHook::default()
        };
        let outcome = controller.post_app_specialize(&mut host, Some(&mut rt), &mut hook);
        assert!(!outcome.hook_armed);
        assert!(host.dlclosed());
        assert_eq!(controller.stage(), Stage::Terminal);
    }

    #[test]
    fn test_props_disabled_unloads_after_patch() {
        let dev = device(Some(r#"{"spoofProps":false}"#));
        let mut host = FakeHost::new(Some(dev.layout.clone()));
        let mut controller = Controller::new();
        controller.pre_app_specialize(&mut host, Some(&mut gms_args(&dev)));

        let mut rt = FakeRuntime::android();
        let mut hook = FakeHook::default();
        let outcome = controller.post_app_specialize(&mut host, Some(&mut rt), &mut hook);
        assert!(outcome.patch.is_some());
        assert!(hook.armed.is_empty());
        assert!(host.dlclosed());
    }

    #[test]
    fn test_broken_document_falls_back_to_defaults() {
        let dev = device(Some("{ not json"));
        let mut host = FakeHost::new(Some(dev.layout.clone()));
        let mut controller = Controller::new();
        controller.pre_app_specialize(&mut host, Some(&mut gms_args(&dev)));

        let mut hook = FakeHook::default();
        let outcome = controller.post_app_specialize(&mut host, None, &mut hook);
        assert_eq!(outcome.resolved.unwrap().spoof, SpoofConfig::default());
        // Runtime unavailable: the patch pass is skipped but the hook still arms.
        assert!(outcome.patch.is_none());
        assert!(outcome.hook_armed);
    }

    #[test]
    fn test_server_specialize_always_unloads() {
        let mut host = FakeHost::new(None);
        let mut controller = Controller::new();
        controller.pre_server_specialize(&mut host);
        assert_eq!(host.options, vec![ModuleOption::DlcloseModuleLibrary]);
        assert_eq!(controller.stage(), Stage::Terminal);
    }
}
