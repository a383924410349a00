//! Process-wide, one-shot-initialized slot for the single application
//! version a clone is allowed to host: a global mutable slot installed once
//! with a one-shot guard (no dynamic dispatch, no replacement, no deletion).

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use errors::ErrorMetadata;
use parking_lot::Mutex;

/// The application bundle this clone serves. The classloader-equivalent is
/// represented as an opaque module-loader handle: the servlet-engine
/// boundary resolves modules through it, since this core never interprets
/// user code directly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppVersion {
    pub app_id: String,
    pub version_id: String,
    pub root_directory: String,
    pub environment: Vec<(String, String)>,
}

/// A single-slot registry: at most one `AppVersion` is ever installed for
/// the lifetime of the process. Reads go through the lock-free
/// `ArcSwapOption`; the one-time install is additionally guarded by a mutex
/// so concurrent installers can't both observe an empty slot and both write.
#[derive(Default)]
pub struct AppVersionRegistry {
    slot: ArcSwapOption<AppVersion>,
    install_guard: Mutex<()>,
}

impl AppVersionRegistry {
    pub fn new() -> Self {
        Self {
            slot: ArcSwapOption::new(None),
            install_guard: Mutex::new(()),
        }
    }

    /// Install `app_version` as the process's one and only application.
    /// Fails if a version is already installed.
    pub fn install(&self, app_version: AppVersion) -> anyhow::Result<()> {
        let _guard = self.install_guard.lock();
        if self.slot.load().is_some() {
            anyhow::bail!(ErrorMetadata::bad_request(
                "AddAppVersionAlreadyCalled",
                "AddAppVersion already called",
            ));
        }
        self.slot.store(Some(Arc::new(app_version)));
        Ok(())
    }

    pub fn current(&self) -> Option<Arc<AppVersion>> {
        self.slot.load_full()
    }

    /// Whether `app_id`/`version_id` names the currently installed version.
    /// Used to classify a request as `UnknownApp` before dispatch.
    pub fn matches(&self, app_id: &str, version_id: &str) -> bool {
        match self.current() {
            Some(current) => current.app_id == app_id && current.version_id == version_id,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(id: &str) -> AppVersion {
        AppVersion {
            app_id: "my-app".to_string(),
            version_id: id.to_string(),
            root_directory: "/app".to_string(),
            environment: Vec::new(),
        }
    }

    #[test]
    fn first_install_succeeds_and_is_visible() {
        let registry = AppVersionRegistry::new();
        assert!(registry.current().is_none());
        registry.install(version("v1")).unwrap();
        assert_eq!(registry.current().unwrap().version_id, "v1");
        assert!(registry.matches("my-app", "v1"));
        assert!(!registry.matches("my-app", "v2"));
        assert!(!registry.matches("other-app", "v1"));
    }

    #[test]
    fn second_install_is_rejected_and_first_stays_installed() {
        let registry = AppVersionRegistry::new();
        registry.install(version("v1")).unwrap();
        let err = registry.install(version("v2")).unwrap_err();
        assert!(format!("{err:#}").contains("AddAppVersion already called"));
        assert_eq!(registry.current().unwrap().version_id, "v1");
    }
}
