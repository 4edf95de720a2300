//! Resource state records.

use crate::property::PropertyMap;
use crate::urn::{ProviderRef, Urn, is_provider_type};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// Options
// ============================================================================

/// Per-operation timeouts handed to providers, in seconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomTimeouts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete: Option<u64>,
}

impl CustomTimeouts {
    pub fn is_empty(&self) -> bool {
        self.create.is_none() && self.update.is_none() && self.delete.is_none()
    }
}

// ============================================================================
// Resource State
// ============================================================================

/// Last known state of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceState {
    pub urn: Urn,
    #[serde(rename = "type")]
    pub ty: String,
    /// Custom resources are managed by a provider; components are not
    pub custom: bool,
    /// Superseded by a replacement and awaiting cleanup
    #[serde(default, skip_serializing_if = "is_false")]
    pub delete: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub inputs: PropertyMap,
    #[serde(default)]
    pub outputs: PropertyMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Urn>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub protect: bool,
    /// Read rather than managed
    #[serde(default, skip_serializing_if = "is_false")]
    pub external: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Urn>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub property_dependencies: BTreeMap<String, Vec<Urn>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderRef>,
    /// Deleted externally ahead of its replacement
    #[serde(default, skip_serializing_if = "is_false")]
    pub pending_replacement: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub retain_on_delete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_before_replace: Option<bool>,
    #[serde(default, skip_serializing_if = "CustomTimeouts::is_empty")]
    pub custom_timeouts: CustomTimeouts,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore_changes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_secret_outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<Urn>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub taint: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_id: Option<String>,
    /// Provider version the resource was registered against, if pinned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    /// Owning resource, set only on views
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_of: Option<Urn>,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(value: &bool) -> bool {
    !*value
}

impl ResourceState {
    /// A fresh record with every option at its default.
    pub fn new(urn: Urn, ty: impl Into<String>, custom: bool) -> Self {
        Self {
            urn,
            ty: ty.into(),
            custom,
            delete: false,
            id: String::new(),
            inputs: PropertyMap::new(),
            outputs: PropertyMap::new(),
            parent: None,
            protect: false,
            external: false,
            dependencies: Vec::new(),
            property_dependencies: BTreeMap::new(),
            provider: None,
            pending_replacement: false,
            retain_on_delete: false,
            delete_before_replace: None,
            custom_timeouts: CustomTimeouts::default(),
            ignore_changes: Vec::new(),
            additional_secret_outputs: Vec::new(),
            aliases: Vec::new(),
            taint: false,
            import_id: None,
            version: None,
            created: None,
            modified: None,
            view_of: None,
        }
    }

    pub fn is_provider(&self) -> bool {
        is_provider_type(&self.ty)
    }

    pub fn is_view(&self) -> bool {
        self.view_of.is_some()
    }

    /// Reference other resources can use to name this provider.
    pub fn provider_ref(&self) -> Option<ProviderRef> {
        (self.is_provider() && !self.id.is_empty())
            .then(|| ProviderRef::new(self.urn.clone(), self.id.clone()))
    }

    /// Every URN this record must follow: parent, provider, dependencies
    /// and property dependencies, deduplicated.
    pub fn predecessors(&self) -> Vec<Urn> {
        let mut urns: Vec<Urn> = Vec::new();
        let mut push = |urn: &Urn| {
            if !urns.contains(urn) {
                urns.push(urn.clone());
            }
        };
        if let Some(parent) = &self.parent {
            push(parent);
        }
        if let Some(provider) = &self.provider {
            push(&provider.urn);
        }
        self.dependencies.iter().for_each(&mut push);
        self.property_dependencies
            .values()
            .flatten()
            .for_each(&mut push);
        urns
    }

    /// Whether this record's lifetime depends on `urn`.
    ///
    /// Parent links are ownership, not lifetime, and do not count.
    pub fn depends_on(&self, urn: &Urn) -> bool {
        self.dependencies.contains(urn)
            || self.property_dependencies.values().any(|deps| deps.contains(urn))
            || self.provider.as_ref().is_some_and(|p| &p.urn == urn)
    }

    /// Apply `rename` to every URN this record refers to.
    pub fn rewrite_references(&mut self, rename: impl Fn(&Urn) -> Option<Urn>) {
        if let Some(parent) = self.parent.as_mut()
            && let Some(renamed) = rename(parent)
        {
            *parent = renamed;
        }
        if let Some(provider) = self.provider.as_mut()
            && let Some(renamed) = rename(&provider.urn)
        {
            provider.urn = renamed;
        }
        for dep in self
            .dependencies
            .iter_mut()
            .chain(self.property_dependencies.values_mut().flatten())
        {
            if let Some(renamed) = rename(dep) {
                *dep = renamed;
            }
        }
    }

    /// Drop every reference to `urn` (used when the resource vanished).
    pub fn forget(&mut self, urn: &Urn) {
        if self.parent.as_ref() == Some(urn) {
            self.parent = None;
        }
        self.dependencies.retain(|dep| dep != urn);
        for deps in self.property_dependencies.values_mut() {
            deps.retain(|dep| dep != urn);
        }
    }
}
