//! Inline hook over `__system_property_read_callback`.
//!
//! Bionic delivers a property's value by calling a caller-supplied callback
//! synchronously from `__system_property_read_callback(pi, callback,
//! cookie)`. The replacement installed here calls the original entry point
//! with [`relay_value`] as the callback and a stack-allocated [`Relay`] as
//! the cookie. The relay carries the caller's own callback and cookie, so
//! every read reaches its real subscriber with the rewritten value, and no
//! subscriber state is kept between reads.
//!
//! The hook is installed at most once per process and never removed. It
//! only depends on [`HookState`], which is published before the patch goes
//! live and is immutable afterwards.
//!
//! The patching engine is pluggable through [`InterceptInstaller`]. On
//! device it is ShadowHook, loaded from the copy the companion staged into
//! the target's data directory.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::panic;
use std::path::Path;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::OnceLock;

use log::{debug, error, info};

use crate::constants::{PROPERTY_LIB, PROPERTY_READ_SYMBOL, SHADOWHOOK_LIB};
use crate::props::PropRewriter;

/// `void (*callback)(void *cookie, const char *name, const char *value, uint32_t serial)`
pub type PropCallback =
    unsafe extern "C" fn(cookie: *mut c_void, name: *const c_char, value: *const c_char, serial: u32);

/// `void __system_property_read_callback(const prop_info *pi, callback, void *cookie)`
pub type ReadCallbackFn =
    unsafe extern "C" fn(pi: *const c_void, callback: Option<PropCallback>, cookie: *mut c_void);

/// Errors raised while installing the hook.
#[derive(Debug)]
pub enum HookError {
    /// The hook was already installed in this process.
    AlreadyInstalled,
    /// The patching engine could not be loaded.
    Load(String),
    /// The patching engine refused to initialize.
    Init(i32),
    /// The patching engine failed to patch the target.
    Install { errno: i32, message: String },
}

impl std::fmt::Display for HookError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HookError::AlreadyInstalled => write!(f, "property hook already installed"),
            HookError::Load(msg) => write!(f, "cannot load hook engine: {}", msg),
            HookError::Init(code) => write!(f, "hook engine init failed with {}", code),
            HookError::Install { errno, message } => {
                write!(f, "hook failed ({}): {}", errno, message)
            }
        }
    }
}

impl std::error::Error for HookError {}

/// A function to intercept, by library and symbol name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterceptTarget {
    pub library: &'static str,
    pub symbol: &'static str,
}

/// The property read entry point in bionic.
pub const READ_CALLBACK_TARGET: InterceptTarget = InterceptTarget {
    library: PROPERTY_LIB,
    symbol: PROPERTY_READ_SYMBOL,
};

/// An inline patching engine.
pub trait InterceptInstaller {
    /// Redirect `target` to `replacement`.
    ///
    /// The address that still reaches the original implementation must be
    /// stored into `original` before the redirect can fire.
    fn install_intercept(
        &self,
        target: &InterceptTarget,
        replacement: *mut c_void,
        original: &AtomicPtr<c_void>,
    ) -> Result<(), HookError>;
}

/// Arms the property hook for a target. Seam used by the controller.
pub trait PropertyHook {
    fn arm(&mut self, staged_dir: &Path, rewriter: PropRewriter, debug: bool) -> Result<(), HookError>;
}

/// Process-wide hook state.
struct HookState {
    original: AtomicPtr<c_void>,
    rewriter: PropRewriter,
    debug: bool,
}

static STATE: OnceLock<HookState> = OnceLock::new();

/// Per-read subscriber, passed to the original as its cookie.
struct Relay {
    callback: PropCallback,
    cookie: *mut c_void,
}

/// Whether the intercept is live in this process.
pub fn is_active() -> bool {
    STATE
        .get()
        .is_some_and(|state| !state.original.load(Ordering::Acquire).is_null())
}

/// Publish `rewriter` and install the intercept through `installer`.
pub fn install<I: InterceptInstaller + ?Sized>(
    installer: &I,
    rewriter: PropRewriter,
    debug: bool,
) -> Result<(), HookError> {
    let mut fresh = false;
    let state = STATE.get_or_init(|| {
        fresh = true;
        HookState {
            original: AtomicPtr::new(std::ptr::null_mut()),
            rewriter,
            debug,
        }
    });
    if !fresh {
        return Err(HookError::AlreadyInstalled);
    }

    let replacement = relay_read_callback as ReadCallbackFn as *mut c_void;
    installer.install_intercept(&READ_CALLBACK_TARGET, replacement, &state.original)?;

    info!(
        "hook {} successful, original at {:p}",
        READ_CALLBACK_TARGET.symbol,
        state.original.load(Ordering::Acquire)
    );
    Ok(())
}

/// Replacement for `__system_property_read_callback`.
///
/// # Safety
/// Called by bionic's callers with the arguments of the original function.
pub unsafe extern "C" fn relay_read_callback(
    pi: *const c_void,
    callback: Option<PropCallback>,
    cookie: *mut c_void,
) {
    let Some(state) = STATE.get() else {
        return;
    };
    let original = state.original.load(Ordering::Acquire);
    if original.is_null() {
        return;
    }
    let original: ReadCallbackFn = unsafe { std::mem::transmute(original) };

    match callback {
        Some(callback) if !pi.is_null() => {
            let mut relay = Relay { callback, cookie };
            unsafe {
                original(
                    pi,
                    Some(relay_value),
                    &mut relay as *mut Relay as *mut c_void,
                )
            };
        }
        _ => unsafe { original(pi, callback, cookie) },
    }
}

/// Callback handed to the original; rewrites and forwards to the real subscriber.
unsafe extern "C" fn relay_value(
    cookie: *mut c_void,
    name: *const c_char,
    value: *const c_char,
    serial: u32,
) {
    let relay = unsafe { &*(cookie as *const Relay) };

    let replacement =
        panic::catch_unwind(panic::AssertUnwindSafe(|| unsafe { rewritten_value(name, value) }))
            .ok()
            .flatten();

    match replacement {
        Some(new_value) => unsafe { (relay.callback)(relay.cookie, name, new_value.as_ptr(), serial) },
        None => unsafe { (relay.callback)(relay.cookie, name, value, serial) },
    }
}

/// The replacement for `value`, or `None` to deliver it unchanged.
unsafe fn rewritten_value(name: *const c_char, value: *const c_char) -> Option<CString> {
    let state = STATE.get()?;
    if name.is_null() || value.is_null() {
        return None;
    }
    let name = unsafe { CStr::from_ptr(name) }.to_string_lossy();
    let old = unsafe { CStr::from_ptr(value) }.to_string_lossy();

    match state.rewriter.substitute(&name) {
        Some(new) if new != old => {
            debug!("[{}]: {} -> {}", name, old, new);
            match CString::new(new) {
                Ok(c) => Some(c),
                Err(_) => {
                    error!("[{}]: replacement contains NUL, keeping original", name);
                    None
                }
            }
        }
        _ => {
            if state.debug {
                debug!("[{}]: {} (unchanged)", name, old);
            }
            None
        }
    }
}

// --- ShadowHook ---

const SHADOWHOOK_MODE_UNIQUE: c_int = 1;

type ShInitFn = unsafe extern "C" fn(mode: c_int, debuggable: bool) -> c_int;
type ShHookSymNameFn = unsafe extern "C" fn(
    lib_name: *const c_char,
    sym_name: *const c_char,
    new_addr: *mut c_void,
    orig_addr: *mut *mut c_void,
) -> *mut c_void;
type ShGetErrnoFn = unsafe extern "C" fn() -> c_int;
type ShToErrmsgFn = unsafe extern "C" fn(error_number: c_int) -> *const c_char;

/// ShadowHook bound at runtime with `dlopen`.
pub struct ShadowHook {
    init: ShInitFn,
    hook_sym_name: ShHookSymNameFn,
    get_errno: ShGetErrnoFn,
    to_errmsg: ShToErrmsgFn,
}

fn dl_error() -> String {
    let msg = unsafe { libc::dlerror() };
    if msg.is_null() {
        "unknown dl error".to_string()
    } else {
        unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
    }
}

/// # Safety
/// `T` must be the function pointer type matching `name`'s C signature.
unsafe fn dl_symbol<T: Copy>(handle: *mut c_void, name: &CStr) -> Result<T, HookError> {
    let sym = unsafe { libc::dlsym(handle, name.as_ptr()) };
    if sym.is_null() {
        return Err(HookError::Load(format!(
            "missing symbol {}: {}",
            name.to_string_lossy(),
            dl_error()
        )));
    }
    Ok(unsafe { std::mem::transmute_copy::<*mut c_void, T>(&sym) })
}

impl ShadowHook {
    /// Load the library at `path` and resolve its entry points.
    ///
    /// The library handle is never closed.
    pub fn load(path: &Path) -> Result<Self, HookError> {
        let c_path = CString::new(path.as_os_str().as_encoded_bytes())
            .map_err(|_| HookError::Load(format!("invalid path {}", path.display())))?;
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW) };
        if handle.is_null() {
            return Err(HookError::Load(dl_error()));
        }
        unsafe {
            Ok(ShadowHook {
                init: dl_symbol(handle, c"shadowhook_init")?,
                hook_sym_name: dl_symbol(handle, c"shadowhook_hook_sym_name")?,
                get_errno: dl_symbol(handle, c"shadowhook_get_errno")?,
                to_errmsg: dl_symbol(handle, c"shadowhook_to_errmsg")?,
            })
        }
    }

    fn last_error(&self) -> HookError {
        let errno = unsafe { (self.get_errno)() };
        let msg = unsafe { (self.to_errmsg)(errno) };
        let message = if msg.is_null() {
            String::new()
        } else {
            unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
        };
        HookError::Install { errno, message }
    }
}

impl InterceptInstaller for ShadowHook {
    fn install_intercept(
        &self,
        target: &InterceptTarget,
        replacement: *mut c_void,
        original: &AtomicPtr<c_void>,
    ) -> Result<(), HookError> {
        let rc = unsafe { (self.init)(SHADOWHOOK_MODE_UNIQUE, true) };
        if rc != 0 {
            return Err(HookError::Init(rc));
        }

        let lib = CString::new(target.library).map_err(|_| HookError::Load(target.library.into()))?;
        let sym = CString::new(target.symbol).map_err(|_| HookError::Load(target.symbol.into()))?;

        // ShadowHook stores the trampoline through `orig_addr` before enabling the patch.
        let stub = unsafe {
            (self.hook_sym_name)(lib.as_ptr(), sym.as_ptr(), replacement, original.as_ptr())
        };
        if stub.is_null() {
            error!("hook {} failed!", target.symbol);
            return Err(self.last_error());
        }
        Ok(())
    }
}

/// Production [`PropertyHook`]: ShadowHook from the staged directory.
#[derive(Debug, Default)]
pub struct StagedShadowHook;

impl PropertyHook for StagedShadowHook {
    fn arm(&mut self, staged_dir: &Path, rewriter: PropRewriter, debug: bool) -> Result<(), HookError> {
        let engine = ShadowHook::load(&staged_dir.join(SHADOWHOOK_LIB))?;
        install(&engine, rewriter, debug)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Stand-in for a `prop_info`.
    struct FakeProp {
        name: CString,
        value: CString,
        serial: u32,
    }

    /// Stand-in for bionic's implementation: reports the fake prop synchronously.
    unsafe extern "C" fn fake_read_callback(
        pi: *const c_void,
        callback: Option<PropCallback>,
        cookie: *mut c_void,
    ) {
        let prop = unsafe { &*(pi as *const FakeProp) };
        if let Some(cb) = callback {
            unsafe { cb(cookie, prop.name.as_ptr(), prop.value.as_ptr(), prop.serial) };
        }
    }

    type Seen = RefCell<Vec<(String, String, u32)>>;

    unsafe extern "C" fn record(cookie: *mut c_void, name: *const c_char, value: *const c_char, serial: u32) {
        let seen = unsafe { &*(cookie as *const Seen) };
        let name = unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned();
        let value = unsafe { CStr::from_ptr(value) }.to_string_lossy().into_owned();
        seen.borrow_mut().push((name, value, serial));
    }

    /// Installer that "patches" by handing out the fake as the original.
    struct FakeInstaller {
        fail: bool,
    }

    impl InterceptInstaller for FakeInstaller {
        fn install_intercept(
            &self,
            target: &InterceptTarget,
            replacement: *mut c_void,
            original: &AtomicPtr<c_void>,
        ) -> Result<(), HookError> {
            assert_eq!(*target, READ_CALLBACK_TARGET);
            assert!(!replacement.is_null());
            if self.fail {
                return Err(HookError::Install {
                    errno: 1,
                    message: "fake".into(),
                });
            }
            original.store(fake_read_callback as ReadCallbackFn as *mut c_void, Ordering::Release);
            Ok(())
        }
    }

    fn read_through_hook(name: &str, value: &str) -> (String, String, u32) {
        let prop = FakeProp {
            name: CString::new(name).unwrap(),
            value: CString::new(value).unwrap(),
            serial: 42,
        };
        let seen: Seen = RefCell::new(Vec::new());
        unsafe {
            relay_read_callback(
                &prop as *const FakeProp as *const c_void,
                Some(record),
                &seen as *const Seen as *mut c_void,
            )
        };
        let mut seen = seen.into_inner();
        assert_eq!(seen.len(), 1, "subscriber must be called exactly once");
        seen.remove(0)
    }

    // The hook state is process-wide, so the whole lifecycle is one test.
    #[test]
    fn test_install_once_and_relay() {
        assert!(!is_active());

        let rewriter = PropRewriter::new(Some("32".into()), Some("2024-01-05".into()), None);
        install(&FakeInstaller { fail: false }, rewriter, true).unwrap();
        assert!(is_active());

        assert!(matches!(
            install(&FakeInstaller { fail: false }, PropRewriter::default(), false),
            Err(HookError::AlreadyInstalled)
        ));

        assert_eq!(
            read_through_hook("init.svc.adbd", "running"),
            ("init.svc.adbd".to_string(), "stopped".to_string(), 42)
        );
        assert_eq!(read_through_hook("sys.usb.state", "mtp,adb").1, "mtp");
        assert_eq!(read_through_hook("ro.product.first_api_level", "34").1, "32");
        assert_eq!(
            read_through_hook("ro.build.version.security_patch", "2025-03-01").1,
            "2024-01-05"
        );
        // No build id override configured.
        assert_eq!(read_through_hook("ro.build.id", "BP1A").1, "BP1A");
        assert_eq!(
            read_through_hook("ro.build.fingerprint", "google/husky/husky:15/X/1:user/release-keys").1,
            "google/husky/husky:15/X/1:user/release-keys"
        );
    }

    #[test]
    fn test_failing_installer_reports_error() {
        let err = FakeInstaller { fail: true }
            .install_intercept(
                &READ_CALLBACK_TARGET,
                relay_read_callback as ReadCallbackFn as *mut c_void,
                &AtomicPtr::new(std::ptr::null_mut()),
            )
            .unwrap_err();
        assert!(err.to_string().contains("fake"));
    }

    #[test]
    fn test_shadowhook_load_missing_library() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ShadowHook::load(&dir.path().join(SHADOWHOOK_LIB)),
            Err(HookError::Load(_))
        ));
        assert!(matches!(
            StagedShadowHook.arm(dir.path(), PropRewriter::default(), false),
            Err(HookError::Load(_))
        ));
    }
}
