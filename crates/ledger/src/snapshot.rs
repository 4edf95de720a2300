//! Snapshots: the ordered list of resource records last known to exist.
//!
//! Order is part of the contract. Parents precede children, providers precede
//! their consumers and dependencies precede dependents, so a snapshot can be
//! walked front to back to create and back to front to delete.

use crate::error::{Error, IntegrityError, Result};
use crate::state::ResourceState;
use crate::urn::{ProviderRef, Urn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

/// Current snapshot format version.
pub const FORMAT_VERSION: &str = "3";

// ============================================================================
// Manifest
// ============================================================================

/// Header describing when and by what a snapshot was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub time: DateTime<Utc>,
    /// blake3 hex digest of `version`, used to detect hand edits of the header
    pub magic: String,
    pub version: String,
}

impl Manifest {
    pub fn new() -> Self {
        Self {
            time: Utc::now(),
            magic: Self::magic_for(FORMAT_VERSION),
            version: FORMAT_VERSION.to_string(),
        }
    }

    pub fn magic_for(version: &str) -> String {
        blake3::hash(version.as_bytes()).to_hex().to_string()
    }

    pub fn is_valid(&self) -> bool {
        self.magic == Self::magic_for(&self.version)
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Pending Operations
// ============================================================================

/// Kind of operation that began but never finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    Creating,
    Updating,
    Deleting,
    Reading,
    Importing,
}

/// An operation recorded as begun with no matching end.
///
/// A `Creating` operation may have left a resource behind that the snapshot
/// knows nothing about, so it is carried forward until someone resolves it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub resource: ResourceState,
    #[serde(rename = "type")]
    pub kind: OperationKind,
}

// ============================================================================
// Snapshot
// ============================================================================

/// Infrastructure as last known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub manifest: Manifest,
    #[serde(default)]
    pub resources: Vec<ResourceState>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_operations: Vec<PendingOperation>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Snapshot {
    pub fn new(resources: Vec<ResourceState>) -> Self {
        Self {
            manifest: Manifest::new(),
            resources,
            pending_operations: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Index of live (non-pending-delete) records by URN.
    pub fn index(&self) -> HashMap<&Urn, usize> {
        self.resources
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.delete)
            .map(|(i, r)| (&r.urn, i))
            .collect()
    }

    /// Live record for `urn`, if any.
    pub fn get(&self, urn: &Urn) -> Option<&ResourceState> {
        self.resources.iter().find(|r| &r.urn == urn && !r.delete)
    }

    /// Views owned by `owner`, in snapshot order.
    pub fn views_of<'a>(&'a self, owner: &'a Urn) -> impl Iterator<Item = &'a ResourceState> + 'a {
        self.resources
            .iter()
            .filter(move |r| r.view_of.as_ref() == Some(owner))
    }

    /// Check every structural invariant. Never repairs anything.
    pub fn verify_integrity(&self) -> std::result::Result<(), IntegrityError> {
        if !self.manifest.is_valid() {
            return Err(IntegrityError::MagicMismatch {
                version: self.manifest.version.clone(),
            });
        }

        let positions: HashMap<&Urn, usize> = self
            .resources
            .iter()
            .enumerate()
            .rev()
            .map(|(i, r)| (&r.urn, i))
            .collect();
        let mut live: HashSet<&Urn> = HashSet::new();
        let mut seen: HashSet<&Urn> = HashSet::new();
        let mut providers: HashMap<ProviderRef, bool> = HashMap::new();

        for (i, resource) in self.resources.iter().enumerate() {
            let urn = &resource.urn;

            if let Some(reference) = &resource.provider {
                match providers.get(reference) {
                    Some(true) => {}
                    Some(false) => {
                        return Err(IntegrityError::NotAProvider {
                            urn: urn.clone(),
                            provider: reference.to_string(),
                        });
                    }
                    None if self.later_provider(i, reference) => {
                        return Err(IntegrityError::ProviderAfterConsumer {
                            urn: urn.clone(),
                            provider: reference.to_string(),
                        });
                    }
                    None => {
                        return Err(IntegrityError::MissingProvider {
                            urn: urn.clone(),
                            provider: reference.to_string(),
                        });
                    }
                }
            }

            if let Some(parent) = &resource.parent {
                if !seen.contains(parent) {
                    return Err(if positions.contains_key(parent) {
                        IntegrityError::ParentAfterChild {
                            urn: urn.clone(),
                            parent: parent.clone(),
                        }
                    } else {
                        IntegrityError::MissingParent {
                            urn: urn.clone(),
                            parent: parent.clone(),
                        }
                    });
                }
            }

            let dependencies = resource
                .dependencies
                .iter()
                .chain(resource.property_dependencies.values().flatten());
            for dependency in dependencies {
                if !seen.contains(dependency) {
                    return Err(if positions.contains_key(dependency) {
                        IntegrityError::DependencyAfterDependent {
                            urn: urn.clone(),
                            dependency: dependency.clone(),
                        }
                    } else {
                        IntegrityError::MissingDependency {
                            urn: urn.clone(),
                            dependency: dependency.clone(),
                        }
                    });
                }
            }

            if !resource.delete && !live.insert(urn) {
                return Err(IntegrityError::DuplicateUrn { urn: urn.clone() });
            }
            seen.insert(urn);

            if !resource.id.is_empty() {
                let reference = ProviderRef::new(urn.clone(), resource.id.clone());
                providers.insert(reference, resource.is_provider());
            }
        }

        for resource in &self.resources {
            let Some(owner) = &resource.view_of else {
                continue;
            };
            let owners: Vec<&ResourceState> =
                self.resources.iter().filter(|r| &r.urn == owner).collect();
            if owners.is_empty() {
                return Err(IntegrityError::MissingViewOwner {
                    urn: resource.urn.clone(),
                    owner: owner.clone(),
                });
            }
            if owners.iter().all(|r| r.is_view()) {
                return Err(IntegrityError::ViewOfView {
                    urn: resource.urn.clone(),
                    owner: owner.clone(),
                });
            }
        }

        Ok(())
    }

    fn later_provider(&self, index: usize, reference: &ProviderRef) -> bool {
        self.resources[index + 1..]
            .iter()
            .any(|r| r.urn == reference.urn && r.id == reference.id)
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Load a snapshot from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|source| Error::File {
            path: path.to_path_buf(),
            source,
        })?;
        let snapshot = serde_json::from_str(&content)?;
        log::debug!("Loaded snapshot from {}", path.display());
        Ok(snapshot)
    }

    /// Write the snapshot as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| Error::File {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).map_err(|source| Error::File {
            path: path.to_path_buf(),
            source,
        })?;
        log::debug!("Saved snapshot to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::urn::provider_type;
    use tempfile::TempDir;

    fn urn(name: &str) -> Urn {
        Urn::new("s", "p", None, "pkg:m:T", name)
    }

    fn provider(name: &str, id: &str) -> ResourceState {
        let ty = provider_type("pkg");
        let mut state = ResourceState::new(Urn::new("s", "p", None, &ty, name), ty, true);
        state.id = id.to_string();
        state
    }

    fn custom(name: &str, provider: &ResourceState) -> ResourceState {
        let mut state = ResourceState::new(urn(name), "pkg:m:T", true);
        state.id = format!("{name}-id");
        state.provider = provider.provider_ref();
        state
    }

    #[test]
    fn test_valid_snapshot() {
        let prov = provider("default", "p1");
        let a = custom("a", &prov);
        let mut b = custom("b", &prov);
        b.dependencies.push(a.urn.clone());
        b.parent = Some(a.urn.clone());
        let snapshot = Snapshot::new(vec![prov, a, b]);
        assert!(snapshot.verify_integrity().is_ok());
    }

    #[test]
    fn test_parent_after_child_rejected() {
        let prov = provider("default", "p1");
        let a = custom("a", &prov);
        let mut b = custom("b", &prov);
        b.parent = Some(a.urn.clone());
        let snapshot = Snapshot::new(vec![prov, b, a]);
        assert!(matches!(
            snapshot.verify_integrity(),
            Err(IntegrityError::ParentAfterChild { .. })
        ));
    }

    #[test]
    fn test_missing_dependency_rejected() {
        let prov = provider("default", "p1");
        let mut a = custom("a", &prov);
        a.dependencies.push(urn("ghost"));
        let snapshot = Snapshot::new(vec![prov, a]);
        assert!(matches!(
            snapshot.verify_integrity(),
            Err(IntegrityError::MissingDependency { .. })
        ));
    }

    #[test]
    fn test_duplicate_allowed_only_when_pending_delete() {
        let prov = provider("default", "p1");
        let mut old = custom("a", &prov);
        let new = custom("a", &prov);
        let snapshot = Snapshot::new(vec![prov.clone(), new.clone(), old.clone()]);
        assert!(matches!(
            snapshot.verify_integrity(),
            Err(IntegrityError::DuplicateUrn { .. })
        ));

        old.delete = true;
        let snapshot = Snapshot::new(vec![prov, new, old]);
        assert!(snapshot.verify_integrity().is_ok());
    }

    #[test]
    fn test_provider_must_precede_consumer() {
        let prov = provider("default", "p1");
        let a = custom("a", &prov);
        let snapshot = Snapshot::new(vec![a.clone(), prov]);
        assert!(matches!(
            snapshot.verify_integrity(),
            Err(IntegrityError::ProviderAfterConsumer { .. })
        ));

        let snapshot = Snapshot::new(vec![a]);
        assert!(matches!(
            snapshot.verify_integrity(),
            Err(IntegrityError::MissingProvider { .. })
        ));
    }

    #[test]
    fn test_provider_ref_must_name_a_provider() {
        let prov = provider("default", "p1");
        let a = custom("a", &prov);
        let mut b = custom("b", &prov);
        b.provider = Some(ProviderRef::new(a.urn.clone(), a.id.clone()));
        let snapshot = Snapshot::new(vec![prov, a, b]);
        assert!(matches!(
            snapshot.verify_integrity(),
            Err(IntegrityError::NotAProvider { .. })
        ));
    }

    #[test]
    fn test_view_owner_checks() {
        let prov = provider("default", "p1");
        let owner = custom("a", &prov);
        let mut view = ResourceState::new(
            Urn::view(&owner.urn, "pkg:m:View", "a-child"),
            "pkg:m:View",
            true,
        );
        view.view_of = Some(owner.urn.clone());

        let snapshot = Snapshot::new(vec![prov.clone(), owner.clone(), view.clone()]);
        assert!(snapshot.verify_integrity().is_ok());

        let snapshot = Snapshot::new(vec![prov.clone(), view.clone()]);
        assert!(matches!(
            snapshot.verify_integrity(),
            Err(IntegrityError::MissingViewOwner { .. })
        ));

        let mut nested = view.clone();
        nested.urn = Urn::view(&view.urn, "pkg:m:View", "nested");
        nested.view_of = Some(view.urn.clone());
        let snapshot = Snapshot::new(vec![prov, owner, view, nested]);
        assert!(matches!(
            snapshot.verify_integrity(),
            Err(IntegrityError::ViewOfView { .. })
        ));
    }

    #[test]
    fn test_tampered_manifest_rejected() {
        let mut snapshot = Snapshot::default();
        snapshot.manifest.version = "999".to_string();
        assert!(matches!(
            snapshot.verify_integrity(),
            Err(IntegrityError::MagicMismatch { .. })
        ));
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state").join("snapshot.json");
        let prov = provider("default", "p1");
        let snapshot = Snapshot::new(vec![prov.clone(), custom("a", &prov)]);
        snapshot.save(&path).unwrap();
        let loaded = Snapshot::load(&path).unwrap();
        assert_eq!(loaded, snapshot);
    }
}
