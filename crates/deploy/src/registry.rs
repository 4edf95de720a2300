//! Built-in management of provider resources.
//!
//! Provider resources (`converge:providers:<pkg>`) are not managed by another
//! provider. Creating one loads a provider instance through the host and
//! assigns it a fresh ID; consumers then refer to it by `urn::id`.

use crate::error::{Error, Result};
use crate::provider::{DiffResponse, Provider, ProviderHost};
use ledger::{ProviderRef, ResourceState, Snapshot, Urn, changed_keys, package_of};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use uuid::Uuid;

/// Name given to the provider a package gets when no explicit one is set.
pub fn default_provider_name(package: &str) -> String {
    format!("default_{package}")
}

/// Loaded provider instances, keyed by provider reference.
pub struct ProviderRegistry {
    host: Arc<dyn ProviderHost>,
    loaded: RwLock<HashMap<ProviderRef, Arc<dyn Provider>>>,
    known: RwLock<HashMap<ProviderRef, ResourceState>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let loaded = self.loaded.read().unwrap_or_else(PoisonError::into_inner).len();
        f.debug_struct("ProviderRegistry")
            .field("loaded", &loaded)
            .finish_non_exhaustive()
    }
}

impl ProviderRegistry {
    /// Registry that can lazily load every provider recorded in `base`.
    pub fn new(host: Arc<dyn ProviderHost>, base: &Snapshot) -> Self {
        let known = base
            .resources
            .iter()
            .filter_map(|state| state.provider_ref().map(|reference| (reference, state.clone())))
            .collect();
        Self {
            host,
            loaded: RwLock::new(HashMap::new()),
            known: RwLock::new(known),
        }
    }

    /// Provider instance for a reference, loading it on first use.
    pub fn get(&self, consumer: &Urn, reference: &ProviderRef) -> Result<Arc<dyn Provider>> {
        if let Some(provider) = self
            .loaded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(reference)
        {
            return Ok(Arc::clone(provider));
        }

        let known = self
            .known
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(reference)
            .cloned()
            .ok_or_else(|| Error::UnknownProvider {
                urn: consumer.clone(),
                reference: reference.to_string(),
            })?;

        log::debug!("Loading recorded provider {reference}");
        let provider = self.load(&known)?;
        self.loaded
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(reference.clone(), Arc::clone(&provider));
        Ok(provider)
    }

    fn load(&self, state: &ResourceState) -> Result<Arc<dyn Provider>> {
        let package = package_of(&state.ty);
        self.host
            .load(package, state.version.as_deref(), &state.inputs)
            .map_err(|source| Error::ProviderLoad {
                package: package.to_string(),
                source,
            })
    }

    /// Provider instance for the resource's own provider reference.
    pub fn provider_of(&self, state: &ResourceState) -> Result<Arc<dyn Provider>> {
        let reference = state.provider.as_ref().ok_or_else(|| Error::UnknownProvider {
            urn: state.urn.clone(),
            reference: "<none>".to_string(),
        })?;
        self.get(&state.urn, reference)
    }

    /// Compare two configurations of a provider resource.
    ///
    /// Provider resources are reconfigured in place, never replaced.
    pub fn diff(&self, old: &ResourceState, new: &ResourceState) -> DiffResponse {
        let mut keys = changed_keys(&old.inputs, &new.inputs);
        if old.version != new.version {
            keys.push("version".to_string());
        }
        if keys.is_empty() {
            DiffResponse::none()
        } else {
            let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
            DiffResponse::some(&keys)
        }
    }

    /// Load a new provider instance and return its ID.
    pub fn create(&self, state: &ResourceState) -> Result<String> {
        let provider = self.load(state)?;
        let id = Uuid::new_v4().to_string();
        let reference = ProviderRef::new(state.urn.clone(), id.clone());
        log::debug!("Loaded provider {reference}");
        self.remember(reference, state, provider);
        Ok(id)
    }

    /// Reload an existing provider instance with new configuration.
    pub fn update(&self, old: &ResourceState, new: &ResourceState) -> Result<()> {
        let provider = self.load(new)?;
        let reference = ProviderRef::new(new.urn.clone(), old.id.clone());
        self.forget(&ProviderRef::new(old.urn.clone(), old.id.clone()));
        self.remember(reference, new, provider);
        Ok(())
    }

    /// Unload a provider instance.
    pub fn delete(&self, old: &ResourceState) {
        self.forget(&ProviderRef::new(old.urn.clone(), old.id.clone()));
    }

    fn remember(&self, reference: ProviderRef, state: &ResourceState, provider: Arc<dyn Provider>) {
        self.known
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(reference.clone(), state.clone());
        self.loaded
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(reference, provider);
    }

    fn forget(&self, reference: &ProviderRef) {
        self.loaded
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(reference);
        self.known
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(reference);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{
        CreateRequest, CreateResponse, DeleteRequest, DiffChanges, ReadRequest, ReadResponse, StaticHost, Status,
        UpdateRequest, UpdateResponse,
    };
    use ledger::{PropertyMap, provider_type};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Inert;

    impl Provider for Inert {
        fn create(&self, _request: CreateRequest) -> anyhow::Result<CreateResponse> {
            Ok(CreateResponse::default())
        }
        fn update(&self, _request: UpdateRequest) -> anyhow::Result<UpdateResponse> {
            Ok(UpdateResponse::default())
        }
        fn delete(&self, _request: DeleteRequest) -> anyhow::Result<Status> {
            Ok(Status::Ok)
        }
        fn read(&self, _request: ReadRequest) -> anyhow::Result<ReadResponse> {
            Ok(ReadResponse::default())
        }
    }

    struct CountingHost(AtomicUsize);

    impl ProviderHost for CountingHost {
        fn load(&self, _package: &str, _version: Option<&str>, _config: &PropertyMap) -> anyhow::Result<Arc<dyn Provider>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Inert))
        }
    }

    fn provider_state(id: &str) -> ResourceState {
        let ty = provider_type("pkg");
        let mut state = ResourceState::new(Urn::new("s", "p", None, &ty, "default_pkg"), ty, true);
        state.id = id.to_string();
        state
    }

    #[test]
    fn test_recorded_providers_load_lazily_once() {
        let host = Arc::new(CountingHost(AtomicUsize::new(0)));
        let state = provider_state("abc");
        let registry = ProviderRegistry::new(host.clone(), &Snapshot::new(vec![state.clone()]));
        assert_eq!(host.0.load(Ordering::SeqCst), 0);

        let consumer = Urn::new("s", "p", None, "pkg:m:T", "a");
        let reference = state.provider_ref().unwrap();
        registry.get(&consumer, &reference).unwrap();
        registry.get(&consumer, &reference).unwrap();
        assert_eq!(host.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unknown_reference_is_an_error() {
        let registry = ProviderRegistry::new(Arc::new(StaticHost::new()), &Snapshot::default());
        let consumer = Urn::new("s", "p", None, "pkg:m:T", "a");
        let reference = provider_state("missing").provider_ref().unwrap();
        assert!(matches!(
            registry.get(&consumer, &reference),
            Err(Error::UnknownProvider { .. })
        ));
    }

    #[test]
    fn test_create_assigns_id_and_delete_unloads() {
        let registry = ProviderRegistry::new(
            Arc::new(StaticHost::new().with("pkg", Arc::new(Inert))),
            &Snapshot::default(),
        );
        let mut state = provider_state("");
        state.id = registry.create(&state).unwrap();
        assert!(!state.id.is_empty());

        let consumer = Urn::new("s", "p", None, "pkg:m:T", "a");
        let reference = state.provider_ref().unwrap();
        assert!(registry.get(&consumer, &reference).is_ok());
        registry.delete(&state);
        assert!(registry.get(&consumer, &reference).is_err());
    }

    #[test]
    fn test_diff_reports_config_and_version() {
        let registry = ProviderRegistry::new(Arc::new(StaticHost::new()), &Snapshot::default());
        let old = provider_state("abc");
        let mut new = old.clone();
        assert_eq!(registry.diff(&old, &new).changes, DiffChanges::None);
        new.version = Some("2.0.0".to_string());
        let diff = registry.diff(&old, &new);
        assert_eq!(diff.changes, DiffChanges::Some);
        assert_eq!(diff.changed_keys, vec!["version"]);
        assert!(diff.replace_keys.is_empty());
    }
}
