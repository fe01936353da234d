//! Ambient environment access, behind a provider seam.
//!
//! Every environment variable lookup and well-known-path read in
//! [`crate::adc`], [`crate::sources`], and [`crate::trust_boundary`] goes
//! through an [`EnvProvider`] rather than `std::env::var` directly, so ADC
//! discovery and Pluggable Auth gating can be tested without mutating the
//! real process environment.

use std::path::PathBuf;
use std::sync::Arc;

/// A source of environment variables and well-known filesystem paths.
pub trait EnvProvider: Send + Sync + std::fmt::Debug {
    /// Reads an environment variable, returning `None` if unset.
    fn var(&self, name: &str) -> Option<String>;

    /// The user's home directory, if determinable.
    fn home_dir(&self) -> Option<PathBuf>;
}

/// The real process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemEnv;

impl EnvProvider for SystemEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }

    fn home_dir(&self) -> Option<PathBuf> {
        home::home_dir()
    }
}

/// A shared, cloneable handle to an [`EnvProvider`].
pub type SharedEnv = Arc<dyn EnvProvider>;

/// Returns the default [`SharedEnv`] (the real process environment).
pub fn system() -> SharedEnv {
    Arc::new(SystemEnv)
}

/// `true` iff the raw string value of `GOOGLE_EXTERNAL_ACCOUNT_ALLOW_EXECUTABLES`
/// is exactly `"1"` — not `"true"`, not `"1 "`, only the literal byte string.
pub const ALLOW_EXECUTABLES_VAR: &str = "GOOGLE_EXTERNAL_ACCOUNT_ALLOW_EXECUTABLES";

/// `GOOGLE_APPLICATION_CREDENTIALS` — path to an ADC JSON file.
pub const GOOGLE_APPLICATION_CREDENTIALS: &str = "GOOGLE_APPLICATION_CREDENTIALS";

/// `CLOUDSDK_CONFIG` — overrides the gcloud config directory.
pub const CLOUDSDK_CONFIG: &str = "CLOUDSDK_CONFIG";

/// `NO_GCE_CHECK` — when `"true"`, skips the metadata-server probe.
pub const NO_GCE_CHECK: &str = "NO_GCE_CHECK";

/// `GCE_METADATA_HOST` — overrides the metadata server host.
pub const GCE_METADATA_HOST: &str = "GCE_METADATA_HOST";

/// `GOOGLE_AUTH_TRUST_BOUNDARY_ENABLE_EXPERIMENT` — opts into trust-boundary
/// fetch-and-cache.
pub const TRUST_BOUNDARY_ENABLE_EXPERIMENT: &str = "GOOGLE_AUTH_TRUST_BOUNDARY_ENABLE_EXPERIMENT";

/// Evaluates the trust-boundary opt-in rule: the *un-lowercased* value
/// `"1"` is accepted, and separately the *lowercased* value `"true"` is
/// accepted — so `"TRUE"` passes (it lowercases to `"true"`) but `"1 "`
/// does not (neither the raw value nor its lowercased form is an exact
/// match).
pub fn is_trust_boundary_enabled(env: &dyn EnvProvider) -> bool {
    match env.var(TRUST_BOUNDARY_ENABLE_EXPERIMENT) {
        Some(raw) => raw == "1" || raw.to_lowercase() == "true",
        None => false,
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// An in-memory environment for deterministic tests.
    #[derive(Debug, Default)]
    pub struct MapEnv {
        vars: Mutex<HashMap<String, String>>,
        home: Option<PathBuf>,
    }

    impl MapEnv {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn with_var(self: &Arc<Self>, name: &str, value: &str) -> Arc<Self> {
            self.vars
                .lock()
                .unwrap()
                .insert(name.to_string(), value.to_string());
            self.clone()
        }

        pub fn set(&self, name: &str, value: &str) {
            self.vars
                .lock()
                .unwrap()
                .insert(name.to_string(), value.to_string());
        }
    }

    impl EnvProvider for MapEnv {
        fn var(&self, name: &str) -> Option<String> {
            self.vars.lock().unwrap().get(name).cloned()
        }

        fn home_dir(&self) -> Option<PathBuf> {
            self.home.clone()
        }
    }
}
