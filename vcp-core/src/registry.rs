//! Backend registry
//!
//! Maps user-facing locations to a backend instance and a backend path.
//! Built once per session and passed by reference.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::backend::{LocalBackend, RepoBackend};
use crate::error::{Error, Result};
use crate::location::Location;

/// Registered backends, keyed by `(protocol, endpoint)`.
pub struct BackendRegistry {
    local: Arc<dyn RepoBackend>,
    stores: HashMap<(String, String), Arc<dyn RepoBackend>>,
    default_endpoint: String,
    cwd: PathBuf,
}

impl BackendRegistry {
    /// Create a registry with only the local filesystem registered.
    pub fn new(default_endpoint: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            local: Arc::new(LocalBackend::new()),
            stores: HashMap::new(),
            default_endpoint: default_endpoint.into(),
            cwd: cwd.into(),
        }
    }

    /// Register a versioned store under its protocol and endpoint.
    pub fn register(&mut self, store: Arc<dyn RepoBackend>) -> Result<()> {
        let key = (store.protocol().to_string(), store.endpoint().to_string());
        if self.stores.contains_key(&key) {
            return Err(Error::validation(format!(
                "store {}://{} already registered",
                key.0, key.1
            )));
        }
        tracing::debug!("Registered store {}://{}", key.0, key.1);
        self.stores.insert(key, store);
        Ok(())
    }

    pub fn get(&self, protocol: &str, endpoint: &str) -> Option<Arc<dyn RepoBackend>> {
        self.stores
            .get(&(protocol.to_string(), endpoint.to_string()))
            .cloned()
    }

    /// `protocol://endpoint` of every registered store.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .stores
            .keys()
            .map(|(protocol, endpoint)| format!("{}://{}", protocol, endpoint))
            .collect();
        names.sort();
        names
    }

    pub fn local(&self) -> Arc<dyn RepoBackend> {
        Arc::clone(&self.local)
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Bind a location string to its backend and backend path.
    pub fn resolve(&self, url: &str) -> Result<(Arc<dyn RepoBackend>, String)> {
        match Location::parse(url, &self.cwd)? {
            Location::Local { path } => Ok((self.local(), path)),
            Location::Store {
                scheme,
                endpoint,
                path,
            } => {
                let endpoint = endpoint.unwrap_or_else(|| self.default_endpoint.clone());
                let backend = self.get(&scheme, &endpoint).ok_or_else(|| {
                    Error::validation(format!("no store registered for {}://{}", scheme, endpoint))
                })?;
                Ok((backend, path))
            }
        }
    }
}
