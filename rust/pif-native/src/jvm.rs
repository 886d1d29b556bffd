//! [`IdentityRuntime`](crate::patch::IdentityRuntime) over a live JNI environment.

use jni::objects::{JClass, JValue};
use jni::JNIEnv;
use log::{debug, warn};

use crate::patch::{FieldOwner, FieldWrite, PatchError, SecondaryLoader, SecondaryUnit, StaticStringFields};

const STRING_SIG: &str = "Ljava/lang/String;";

impl From<jni::errors::Error> for PatchError {
    fn from(err: jni::errors::Error) -> Self {
        PatchError::Runtime {
            step: "jni",
            message: err.to_string(),
        }
    }
}

/// Log and clear a pending Java exception, then describe `err`.
fn jni_error(env: &mut JNIEnv<'_>, step: &'static str, err: jni::errors::Error) -> PatchError {
    if env.exception_check().unwrap_or(false) {
        let _ = env.exception_describe();
        let _ = env.exception_clear();
    }
    PatchError::Runtime {
        step,
        message: err.to_string(),
    }
}

/// The build classes of the running process, resolved once.
pub struct JvmRuntime<'a, 'local> {
    env: &'a mut JNIEnv<'local>,
    build: JClass<'local>,
    version: JClass<'local>,
}

impl<'a, 'local> JvmRuntime<'a, 'local> {
    pub fn new(env: &'a mut JNIEnv<'local>) -> Result<Self, PatchError> {
        let build = match env.find_class(FieldOwner::Build.class_name()) {
            Ok(class) => class,
            Err(e) => return Err(jni_error(env, "find android/os/Build", e)),
        };
        let version = match env.find_class(FieldOwner::BuildVersion.class_name()) {
            Ok(class) => class,
            Err(e) => return Err(jni_error(env, "find android/os/Build$VERSION", e)),
        };
        Ok(JvmRuntime { env, build, version })
    }
}

impl StaticStringFields for JvmRuntime<'_, '_> {
    fn write_static_string(&mut self, owner: FieldOwner, name: &str, value: &str) -> FieldWrite {
        let class = match owner {
            FieldOwner::Build => &self.build,
            FieldOwner::BuildVersion => &self.version,
        };

        let field = match self.env.get_static_field_id(class, name, STRING_SIG) {
            Ok(id) => id,
            Err(_) => {
                // NoSuchFieldError is expected when probing the first owner.
                if self.env.exception_check().unwrap_or(false) {
                    let _ = self.env.exception_clear();
                }
                return FieldWrite::Missing;
            }
        };

        let jvalue = match self.env.new_string(value) {
            Ok(s) => s,
            Err(e) => return FieldWrite::Rejected(jni_error(self.env, "new_string", e).to_string()),
        };
        let result = self
            .env
            .set_static_field(class, field, JValue::Object(&jvalue));
        let _ = self.env.delete_local_ref(jvalue);

        match result {
            Ok(()) => FieldWrite::Written,
            Err(e) => FieldWrite::Rejected(jni_error(self.env, "set_static_field", e).to_string()),
        }
    }
}

impl SecondaryLoader for JvmRuntime<'_, '_> {
    fn launch(
        &mut self,
        unit: &SecondaryUnit,
        document: &str,
        spoof_provider: bool,
        spoof_signature: bool,
    ) -> Result<(), PatchError> {
        debug!("loading {}", unit.dex_path.display());
        let entry_class = unit.entry_class;

        let result = self.env.with_local_frame(16, |env| -> Result<(), PatchError> {
            let system_loader = env
                .call_static_method(
                    "java/lang/ClassLoader",
                    "getSystemClassLoader",
                    "()Ljava/lang/ClassLoader;",
                    &[],
                )
                .and_then(|v| v.l())
                .map_err(|e| jni_error(env, "getSystemClassLoader", e))?;

            let dex_path = env.new_string(unit.dex_path.to_string_lossy())?;
            let library_dir = env.new_string(unit.library_dir.to_string_lossy())?;
            let loader = env
                .new_object(
                    "dalvik/system/PathClassLoader",
                    "(Ljava/lang/String;Ljava/lang/String;Ljava/lang/ClassLoader;)V",
                    &[
                        JValue::Object(&dex_path),
                        JValue::Object(&library_dir),
                        JValue::Object(&system_loader),
                    ],
                )
                .map_err(|e| jni_error(env, "new PathClassLoader", e))?;

            let class_name = env.new_string(entry_class)?;
            let entry: JClass = env
                .call_method(
                    &loader,
                    "loadClass",
                    "(Ljava/lang/String;)Ljava/lang/Class;",
                    &[JValue::Object(&class_name)],
                )
                .and_then(|v| v.l())
                .map(JClass::from)
                .map_err(|e| jni_error(env, "loadClass", e))?;
            if entry.is_null() {
                return Err(PatchError::Runtime {
                    step: "loadClass",
                    message: format!("{} not found", entry_class),
                });
            }

            let json = env.new_string(document)?;
            env.call_static_method(
                &entry,
                unit.entry_method,
                unit.entry_signature,
                &[
                    JValue::Object(&json),
                    JValue::Bool(spoof_provider.into()),
                    JValue::Bool(spoof_signature.into()),
                ],
            )
            .map_err(|e| jni_error(env, "entry point", e))?;
            Ok(())
        });

        if let Err(e) = &result {
            warn!("{} not entered: {}", entry_class, e);
        }
        result
    }
}
