use std::collections::HashMap;
use std::env as stdenv;
use std::ffi::OsString;

/// Name of the variable holding the executable search path.
pub const SEARCH_PATH_VAR: &str = "PATH";

/// User-level view of the process environment used while building pipelines.
///
/// The environment is a snapshot of the process variables taken at construction time.
/// Overrides made with [`Environment::set_var`] only affect lookups done by this crate;
/// launched children still inherit the real process environment.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    /// Key-value store of environment variables (e.g., PATH, HOME).
    pub vars: HashMap<String, String>,
}

impl Environment {
    /// Capture the current process variables into a new `Environment` instance.
    pub fn new() -> Self {
        Self {
            vars: stdenv::vars().collect(),
        }
    }

    /// An environment whose only variable is the given search path.
    ///
    /// Handy for tests and embedders that must not depend on the caller's `PATH`.
    pub fn with_search_path(search_path: impl Into<String>) -> Self {
        let mut env = Self::default();
        env.set_var(SEARCH_PATH_VAR, search_path);
        env
    }

    /// Get the value of an environment variable from the snapshot.
    pub fn get_var(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }

    /// Set or override an environment variable in `self.vars`.
    pub fn set_var(&mut self, key: impl Into<String>, val: impl Into<String>) {
        self.vars.insert(key.into(), val.into());
    }

    /// Forget a variable, so lookups behave as if it was never set.
    pub fn remove_var(&mut self, key: &str) {
        self.vars.remove(key);
    }

    /// Current value of the search-path variable, read fresh on every call.
    pub fn search_path(&self) -> Option<OsString> {
        self.get_var(SEARCH_PATH_VAR).map(OsString::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_set_and_get_var() {
        let mut env = Environment::default();

        // initially absent
        assert_eq!(env.get_var("SOME_RANDOM_ENV_VAR_12345"), None);

        env.set_var("KEY", "VALUE");
        assert_eq!(env.get_var("KEY"), Some("VALUE".to_string()));

        env.remove_var("KEY");
        assert_eq!(env.get_var("KEY"), None);
    }

    #[test]
    fn test_env_reads_from_process_env() {
        let env = Environment::new();
        assert!(env.search_path().is_some());
    }

    #[test]
    fn pinned_search_path_ignores_process_env() {
        let env = Environment::with_search_path("/a:/b");
        assert_eq!(env.search_path(), Some(OsString::from("/a:/b")));
        assert_eq!(env.get_var("HOME"), None);
    }
}
