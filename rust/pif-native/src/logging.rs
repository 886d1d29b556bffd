//! Logger setup. Logcat on device, stderr elsewhere.

use crate::constants::{LOG_TAG, MAX_LOG_LEVEL};

/// Install the process logger. Safe to call more than once.
#[cfg(target_os = "android")]
pub fn init() {
    android_logger::init_once(
        android_logger::Config::default()
            .with_max_level(MAX_LOG_LEVEL)
            .with_tag(LOG_TAG),
    );
}

/// Install the process logger. Safe to call more than once.
#[cfg(not(target_os = "android"))]
pub fn init() {
    let _ = env_logger::Builder::new()
        .filter_level(MAX_LOG_LEVEL)
        .format_target(false)
        .format_module_path(false)
        .parse_default_env()
        .try_init();
    log::trace!("{} logger ready", LOG_TAG);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
        assert!(log::max_level() >= log::LevelFilter::Error);
    }
}
