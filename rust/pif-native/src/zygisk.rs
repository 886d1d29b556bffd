//! Zygisk module ABI (API version 4) and the exported entry points.
//!
//! The loader calls `zygisk_module_entry` once in zygote with its API table.
//! The module registers a [`ModuleAbi`] whose callbacks forward to the
//! [`Controller`]. `zygisk_companion_entry` runs in the root daemon, once per
//! connection.

use std::ffi::{c_int, c_long, c_void};
use std::io;
use std::os::fd::FromRawFd;
use std::os::unix::net::UnixStream;
use std::panic::{self, AssertUnwindSafe};

use jni::objects::JString;
use jni::sys::{jint, jintArray, jobjectArray, jstring};
use jni::JNIEnv;
use log::{debug, error};

use crate::companion::{self, StagingLayout};
use crate::constants::COMPANION_TIMEOUT;
use crate::controller::{Controller, ModuleHost, ModuleOption, SpecializeArgs};
use crate::hook::StagedShadowHook;
use crate::jvm::JvmRuntime;
use crate::logging;
use crate::patch::IdentityRuntime;

pub const ZYGISK_API_VERSION: c_long = 4;

/// Numeric values of [`ModuleOption`] on the wire.
const OPTION_FORCE_DENYLIST_UNMOUNT: c_int = 0;
const OPTION_DLCLOSE_MODULE_LIBRARY: c_int = 1;

/// Table of host functions handed to the module entry.
#[repr(C)]
pub struct ApiTable {
    pub impl_: *mut c_void,
    pub register_module: Option<unsafe extern "C" fn(*mut ApiTable, *mut ModuleAbi) -> bool>,
    pub hook_jni_native_methods: *mut c_void,
    pub plt_hook_register: *mut c_void,
    pub exempt_fd: *mut c_void,
    pub plt_hook_commit: *mut c_void,
    pub connect_companion: Option<unsafe extern "C" fn(*mut c_void) -> c_int>,
    pub set_option: Option<unsafe extern "C" fn(*mut c_void, c_int)>,
    pub get_module_dir: Option<unsafe extern "C" fn(*mut c_void) -> c_int>,
    pub get_flags: Option<unsafe extern "C" fn(*mut c_void) -> u32>,
}

/// Module side of the registration.
#[repr(C)]
pub struct ModuleAbi {
    pub api_version: c_long,
    pub impl_: *mut c_void,
    pub pre_app_specialize: unsafe extern "C" fn(*mut c_void, *mut AppSpecializeArgs),
    pub post_app_specialize: unsafe extern "C" fn(*mut c_void, *const AppSpecializeArgs),
    pub pre_server_specialize: unsafe extern "C" fn(*mut c_void, *mut ServerSpecializeArgs),
    pub post_server_specialize: unsafe extern "C" fn(*mut c_void, *const ServerSpecializeArgs),
}

/// Leading, version independent part of the app specialization arguments.
/// Every member is a reference into the caller's frame.
#[repr(C)]
pub struct AppSpecializeArgs {
    pub uid: *mut jint,
    pub gid: *mut jint,
    pub gids: *mut jintArray,
    pub runtime_flags: *mut jint,
    pub rlimits: *mut jobjectArray,
    pub mount_external: *mut jint,
    pub se_info: *mut jstring,
    pub nice_name: *mut jstring,
    pub instruction_set: *mut jstring,
    pub app_data_dir: *mut jstring,
}

/// Never read by this module.
#[repr(C)]
pub struct ServerSpecializeArgs {
    _private: [u8; 0],
}

/// [`ModuleHost`] over the loader's API table.
#[derive(Clone, Copy)]
struct ZygiskHost {
    table: *mut ApiTable,
}

impl ModuleHost for ZygiskHost {
    type Channel = UnixStream;

    fn connect_companion(&mut self) -> io::Result<UnixStream> {
        let table = unsafe { &*self.table };
        let connect = table
            .connect_companion
            .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "no connectCompanion"))?;
        let fd = unsafe { connect(table.impl_) };
        if fd < 0 {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "companion unavailable",
            ));
        }
        let stream = unsafe { UnixStream::from_raw_fd(fd) };
        stream.set_read_timeout(Some(COMPANION_TIMEOUT))?;
        stream.set_write_timeout(Some(COMPANION_TIMEOUT))?;
        Ok(stream)
    }

    fn set_option(&mut self, option: ModuleOption) {
        let table = unsafe { &*self.table };
        let Some(set_option) = table.set_option else {
            return;
        };
        let value = match option {
            ModuleOption::ForceDenylistUnmount => OPTION_FORCE_DENYLIST_UNMOUNT,
            ModuleOption::DlcloseModuleLibrary => OPTION_DLCLOSE_MODULE_LIBRARY,
        };
        unsafe { set_option(table.impl_, value) };
    }
}

/// Lazy reader over [`AppSpecializeArgs`].
struct JniArgs<'a, 'local> {
    env: &'a mut JNIEnv<'local>,
    args: *const AppSpecializeArgs,
}

impl JniArgs<'_, '_> {
    fn read(&mut self, slot: *mut jstring) -> Option<String> {
        if slot.is_null() {
            return None;
        }
        let raw = unsafe { *slot };
        if raw.is_null() {
            return None;
        }
        // Borrowed local reference owned by the caller; not deleted here.
        let jstr = unsafe { JString::from_raw(raw) };
        let value = match self.env.get_string(&jstr) {
            Ok(s) => Some(String::from(s)),
            Err(e) => {
                error!("cannot read specialize argument: {}", e);
                let _ = self.env.exception_clear();
                None
            }
        };
        value
    }
}

impl SpecializeArgs for JniArgs<'_, '_> {
    fn app_data_dir(&mut self) -> Option<String> {
        let slot = unsafe { (*self.args).app_data_dir };
        self.read(slot)
    }

    fn nice_name(&mut self) -> Option<String> {
        let slot = unsafe { (*self.args).nice_name };
        self.read(slot)
    }
}

/// Per-zygote module instance.
struct PifModule {
    table: *mut ApiTable,
    env: *mut jni::sys::JNIEnv,
    controller: Controller,
}

impl PifModule {
    fn host(&self) -> ZygiskHost {
        ZygiskHost { table: self.table }
    }

    fn pre_app(&mut self, args: *mut AppSpecializeArgs) {
        let mut host = self.host();
        let mut env = unsafe { JNIEnv::from_raw(self.env) }.ok();
        match (env.as_mut(), args.is_null()) {
            (Some(env), false) => {
                let mut reader = JniArgs { env, args };
                self.controller.pre_app_specialize(&mut host, Some(&mut reader));
            }
            _ => {
                self.controller.pre_app_specialize(&mut host, None);
            }
        }
    }

    fn post_app(&mut self) {
        let mut host = self.host();
        let mut hook = StagedShadowHook;
        let mut env = unsafe { JNIEnv::from_raw(self.env) }.ok();

        let mut runtime = match env.as_mut() {
            Some(env) if self.controller.is_engaged() => match JvmRuntime::new(env) {
                Ok(rt) => Some(rt),
                Err(e) => {
                    error!("{}", e);
                    None
                }
            },
            _ => None,
        };
        let runtime = runtime.as_mut().map(|rt| rt as &mut dyn IdentityRuntime);
        self.controller.post_app_specialize(&mut host, runtime, &mut hook);
    }

    fn pre_server(&mut self) {
        let mut host = self.host();
        self.controller.pre_server_specialize(&mut host);
    }
}

fn guarded(what: &str, f: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!("panic in {}", what);
    }
}

unsafe extern "C" fn pre_app_specialize(module: *mut c_void, args: *mut AppSpecializeArgs) {
    let Some(module) = (unsafe { (module as *mut PifModule).as_mut() }) else {
        return;
    };
    guarded("preAppSpecialize", || module.pre_app(args));
}

unsafe extern "C" fn post_app_specialize(module: *mut c_void, _args: *const AppSpecializeArgs) {
    let Some(module) = (unsafe { (module as *mut PifModule).as_mut() }) else {
        return;
    };
    guarded("postAppSpecialize", || module.post_app());
}

unsafe extern "C" fn pre_server_specialize(module: *mut c_void, _args: *mut ServerSpecializeArgs) {
    let Some(module) = (unsafe { (module as *mut PifModule).as_mut() }) else {
        return;
    };
    guarded("preServerSpecialize", || module.pre_server());
}

unsafe extern "C" fn post_server_specialize(_module: *mut c_void, _args: *const ServerSpecializeArgs) {}

/// Module entry, called by the loader in zygote.
///
/// # Safety
/// `table` must be the loader's API table and `env` zygote's JNI environment.
#[no_mangle]
pub unsafe extern "C" fn zygisk_module_entry(table: *mut ApiTable, env: *mut jni::sys::JNIEnv) {
    logging::init();
    let Some(register) = (unsafe { table.as_ref() }).and_then(|t| t.register_module) else {
        error!("invalid zygisk api table");
        return;
    };

    let module = Box::into_raw(Box::new(PifModule {
        table,
        env,
        controller: Controller::new(),
    }));
    let abi = Box::into_raw(Box::new(ModuleAbi {
        api_version: ZYGISK_API_VERSION,
        impl_: module as *mut c_void,
        pre_app_specialize,
        post_app_specialize,
        pre_server_specialize,
        post_server_specialize,
    }));

    if unsafe { register(table, abi) } {
        debug!("module registered, api {}", ZYGISK_API_VERSION);
    } else {
        error!("zygisk refused api version {}", ZYGISK_API_VERSION);
        unsafe {
            drop(Box::from_raw(abi));
            drop(Box::from_raw(module));
        }
    }
}

/// Companion entry, called by the root daemon for each connection.
///
/// # Safety
/// `client` must be an open socket whose ownership passes to this call.
#[no_mangle]
pub unsafe extern "C" fn zygisk_companion_entry(client: c_int) {
    logging::init();
    if client < 0 {
        return;
    }
    let stream = unsafe { UnixStream::from_raw_fd(client) };
    let layout = StagingLayout::device();
    if panic::catch_unwind(AssertUnwindSafe(|| companion::serve(stream, &layout))).is_err() {
        error!("[ROOT] companion panicked");
    }
}

// The loader sees both tables as arrays of pointer-sized slots.
const _: () = {
    assert!(std::mem::size_of::<ApiTable>() == 10 * std::mem::size_of::<usize>());
    assert!(std::mem::size_of::<ModuleAbi>() == 6 * std::mem::size_of::<usize>());
};
