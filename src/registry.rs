use crate::{client::PostHog, config::Config, transport::HttpClient};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

/// Owns named client instances.
///
/// Embeddings that run several projects side by side (different tokens or
/// hosts) create each through a registry and look them up by name, instead of
/// sharing an ambient global namespace.
pub struct Registry<C: HttpClient + 'static> {
    instances: Mutex<HashMap<String, Arc<PostHog<C>>>>,
}

impl<C: HttpClient + 'static> Default for Registry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: HttpClient + 'static> std::fmt::Debug for Registry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let instances = self.instances.lock().expect("registry lock poisoned");
        f.debug_struct("Registry")
            .field("instances", &instances.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<C: HttpClient + 'static> Registry<C> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Create a client under `name` and take ownership of it. An existing
    /// instance under the same name is replaced.
    pub fn init(&self, name: impl Into<String>, config: Config, client: C) -> Arc<PostHog<C>> {
        let name = name.into();
        let instance = PostHog::new(config, client);
        let mut instances = self.instances.lock().expect("registry lock poisoned");
        if instances
            .insert(name.clone(), Arc::clone(&instance))
            .is_some()
        {
            tracing::warn!(name = %name, "replacing existing client instance");
        }
        instance
    }

    /// Look up an instance by name.
    pub fn get(&self, name: &str) -> Option<Arc<PostHog<C>>> {
        self.instances
            .lock()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// Names of all registered instances.
    pub fn names(&self) -> Vec<String> {
        self.instances
            .lock()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Flush every instance best-effort; called from the host's teardown
    /// hook.
    pub fn unload_all(&self) {
        for instance in self
            .instances
            .lock()
            .expect("registry lock poisoned")
            .values()
        {
            instance.unload();
        }
    }
}
