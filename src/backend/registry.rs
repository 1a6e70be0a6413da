use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use super::{FrameInference, ModelBackend, StubBackend};

/// Named model backends. `infer` takes `&mut self`, so each sits behind a `Mutex`.
pub struct BackendRegistry {
    backends: HashMap<String, Arc<Mutex<dyn ModelBackend>>>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            default_name: None,
        }
    }

    /// Registry with every built-in backend; `stub` is the default.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(StubBackend::new());
        registry
    }

    /// The first registered backend becomes the default.
    pub fn register<B: ModelBackend + 'static>(&mut self, backend: B) {
        let name = backend.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.backends.insert(name, Arc::new(Mutex::new(backend)));
    }

    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.backends.contains_key(name) {
            return Err(anyhow!(
                "backend '{}' not registered (available: {})",
                name,
                self.list().join(", ")
            ));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Mutex<dyn ModelBackend>>> {
        self.backends.get(name).cloned()
    }

    pub fn default_backend(&self) -> Option<Arc<Mutex<dyn ModelBackend>>> {
        self.default_name.as_ref().and_then(|name| self.get(name))
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run the default backend over one batch of frames.
    pub fn infer(&self, frame_refs: &[&str]) -> Result<Vec<FrameInference>> {
        let backend = self
            .default_backend()
            .ok_or_else(|| anyhow!("no model backend registered"))?;
        let mut guard = backend
            .lock()
            .map_err(|_| anyhow!("backend lock poisoned"))?;
        let results = guard.infer(frame_refs)?;
        if results.len() != frame_refs.len() {
            return Err(anyhow!(
                "backend {} returned {} results for {} frames",
                guard.name(),
                results.len(),
                frame_refs.len()
            ));
        }
        Ok(results)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
