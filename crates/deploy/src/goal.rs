//! Registrations as the program declares them, and the goals they resolve to.

use ledger::{CustomTimeouts, PropertyMap, PropertyValue, ProviderRef, ResourceState, Urn, provider_type};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Callback that may rewrite a registration before it is processed.
#[derive(Clone)]
pub struct Transform(Arc<dyn Fn(&mut RegisterResource) -> anyhow::Result<()> + Send + Sync>);

impl Transform {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut RegisterResource) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn apply(&self, args: &mut RegisterResource) -> anyhow::Result<()> {
        (self.0)(args)
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Transform")
    }
}

/// Parent an alias spec resolves against.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AliasParent {
    /// Same parent as the registration
    #[default]
    Inherit,
    /// No parent
    Root,
    Urn(Urn),
}

/// Partial description of a previous identity. Unset fields default to
/// the registration's own values.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AliasSpec {
    pub name: Option<String>,
    pub ty: Option<String>,
    pub parent: AliasParent,
    pub stack: Option<String>,
    pub project: Option<String>,
}

/// A URN the resource may previously have been recorded under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Alias {
    Urn(Urn),
    Spec(AliasSpec),
}

impl Alias {
    pub fn name(name: impl Into<String>) -> Self {
        Alias::Spec(AliasSpec {
            name: Some(name.into()),
            ..AliasSpec::default()
        })
    }

    pub fn ty(ty: impl Into<String>) -> Self {
        Alias::Spec(AliasSpec {
            ty: Some(ty.into()),
            ..AliasSpec::default()
        })
    }
}

/// Options attached to a registration.
#[derive(Debug, Clone, Default)]
pub struct ResourceOptions {
    pub parent: Option<Urn>,
    /// `None` inherits from the parent
    pub protect: Option<bool>,
    pub dependencies: Vec<Urn>,
    pub property_dependencies: BTreeMap<String, Vec<Urn>>,
    pub provider: Option<ProviderRef>,
    pub version: Option<String>,
    /// `None` lets the provider decide
    pub delete_before_replace: Option<bool>,
    pub retain_on_delete: bool,
    pub ignore_changes: Vec<String>,
    pub replace_on_changes: Vec<String>,
    pub additional_secret_outputs: Vec<String>,
    pub custom_timeouts: CustomTimeouts,
    pub aliases: Vec<Alias>,
    pub import_id: Option<String>,
    pub transforms: Vec<Transform>,
}

/// A resource registration sent by the program.
#[derive(Debug, Clone)]
pub struct RegisterResource {
    pub ty: String,
    pub name: String,
    pub custom: bool,
    /// Component implemented by a provider's `construct`
    pub remote: bool,
    pub inputs: PropertyMap,
    pub options: ResourceOptions,
}

impl RegisterResource {
    /// Registration of a provider-managed resource.
    pub fn custom(ty: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            ty: ty.into(),
            name: name.into(),
            custom: true,
            remote: false,
            inputs: PropertyMap::new(),
            options: ResourceOptions::default(),
        }
    }

    /// Registration of a component, a logical grouping with no provider.
    pub fn component(ty: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            custom: false,
            ..Self::custom(ty, name)
        }
    }

    /// Registration of an explicit provider resource for `package`.
    pub fn provider(package: &str, name: impl Into<String>) -> Self {
        Self::custom(provider_type(package), name)
    }

    pub fn input(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.inputs.insert(key.into(), value.into());
        self
    }

    pub fn inputs(mut self, inputs: PropertyMap) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn remote(mut self) -> Self {
        self.remote = true;
        self
    }

    pub fn parent(mut self, parent: &Urn) -> Self {
        self.options.parent = Some(parent.clone());
        self
    }

    pub fn protect(mut self, protect: bool) -> Self {
        self.options.protect = Some(protect);
        self
    }

    pub fn depends_on(mut self, urn: &Urn) -> Self {
        self.options.dependencies.push(urn.clone());
        self
    }

    pub fn property_dependency(mut self, key: impl Into<String>, urns: &[Urn]) -> Self {
        self.options
            .property_dependencies
            .entry(key.into())
            .or_default()
            .extend(urns.iter().cloned());
        self
    }

    pub fn provider_ref(mut self, provider: ProviderRef) -> Self {
        self.options.provider = Some(provider);
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.options.version = Some(version.into());
        self
    }

    pub fn delete_before_replace(mut self, enabled: bool) -> Self {
        self.options.delete_before_replace = Some(enabled);
        self
    }

    pub fn retain_on_delete(mut self, retain: bool) -> Self {
        self.options.retain_on_delete = retain;
        self
    }

    pub fn ignore_changes(mut self, keys: &[&str]) -> Self {
        self.options
            .ignore_changes
            .extend(keys.iter().map(ToString::to_string));
        self
    }

    pub fn replace_on_changes(mut self, keys: &[&str]) -> Self {
        self.options
            .replace_on_changes
            .extend(keys.iter().map(ToString::to_string));
        self
    }

    pub fn additional_secret_outputs(mut self, keys: &[&str]) -> Self {
        self.options
            .additional_secret_outputs
            .extend(keys.iter().map(ToString::to_string));
        self
    }

    pub fn custom_timeouts(mut self, timeouts: CustomTimeouts) -> Self {
        self.options.custom_timeouts = timeouts;
        self
    }

    pub fn alias(mut self, alias: Alias) -> Self {
        self.options.aliases.push(alias);
        self
    }

    pub fn import(mut self, id: impl Into<String>) -> Self {
        self.options.import_id = Some(id.into());
        self
    }

    pub fn transform(mut self, transform: Transform) -> Self {
        self.options.transforms.push(transform);
        self
    }
}

/// A request to track an existing external resource.
#[derive(Debug, Clone)]
pub struct ReadResource {
    pub ty: String,
    pub name: String,
    pub id: String,
    pub inputs: PropertyMap,
    pub parent: Option<Urn>,
    pub provider: Option<ProviderRef>,
    pub dependencies: Vec<Urn>,
    pub version: Option<String>,
}

impl ReadResource {
    pub fn new(ty: impl Into<String>, name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            ty: ty.into(),
            name: name.into(),
            id: id.into(),
            inputs: PropertyMap::new(),
            parent: None,
            provider: None,
            dependencies: Vec::new(),
            version: None,
        }
    }

    pub fn parent(mut self, parent: &Urn) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    pub fn provider_ref(mut self, provider: ProviderRef) -> Self {
        self.provider = Some(provider);
        self
    }
}

/// What the program gets back for a completed registration.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterResponse {
    pub urn: Urn,
    pub id: String,
    pub outputs: PropertyMap,
}

impl RegisterResponse {
    pub(crate) fn from_state(state: &ResourceState) -> Self {
        Self {
            urn: state.urn.clone(),
            id: state.id.clone(),
            outputs: state.outputs.clone(),
        }
    }

    /// Reference consumers use to select this resource as their provider.
    pub fn provider_ref(&self) -> ProviderRef {
        ProviderRef::new(self.urn.clone(), self.id.clone())
    }
}

/// Fully resolved desired state of one resource.
#[derive(Debug, Clone)]
pub struct Goal {
    pub urn: Urn,
    pub ty: String,
    pub name: String,
    pub custom: bool,
    pub remote: bool,
    pub inputs: PropertyMap,
    pub parent: Option<Urn>,
    pub protect: bool,
    pub dependencies: Vec<Urn>,
    pub property_dependencies: BTreeMap<String, Vec<Urn>>,
    pub provider: Option<ProviderRef>,
    pub version: Option<String>,
    pub delete_before_replace: Option<bool>,
    pub retain_on_delete: bool,
    pub ignore_changes: Vec<String>,
    pub replace_on_changes: Vec<String>,
    pub additional_secret_outputs: Vec<String>,
    pub custom_timeouts: CustomTimeouts,
    pub aliases: Vec<Urn>,
    pub import_id: Option<String>,
}

impl Goal {
    /// Record this goal would produce, before any provider has run.
    pub fn to_state(&self) -> ResourceState {
        let mut state = ResourceState::new(self.urn.clone(), self.ty.clone(), self.custom);
        state.inputs = self.inputs.clone();
        state.parent = self.parent.clone();
        state.protect = self.protect;
        state.dependencies = self.dependencies.clone();
        state.property_dependencies = self.property_dependencies.clone();
        state.provider = self.provider.clone();
        state.version = self.version.clone();
        state.delete_before_replace = self.delete_before_replace;
        state.retain_on_delete = self.retain_on_delete;
        state.ignore_changes = self.ignore_changes.clone();
        state.additional_secret_outputs = self.additional_secret_outputs.clone();
        state.custom_timeouts = self.custom_timeouts.clone();
        state.aliases = self.aliases.clone();
        state.import_id = self.import_id.clone();
        state
    }
}

/// Resolved request to read an external resource.
#[derive(Debug, Clone)]
pub struct ReadGoal {
    pub urn: Urn,
    pub ty: String,
    pub id: String,
    pub inputs: PropertyMap,
    pub parent: Option<Urn>,
    pub provider: Option<ProviderRef>,
    pub dependencies: Vec<Urn>,
    pub version: Option<String>,
}

impl ReadGoal {
    pub fn to_state(&self) -> ResourceState {
        let mut state = ResourceState::new(self.urn.clone(), self.ty.clone(), true);
        state.id = self.id.clone();
        state.inputs = self.inputs.clone();
        state.parent = self.parent.clone();
        state.provider = self.provider.clone();
        state.dependencies = self.dependencies.clone();
        state.version = self.version.clone();
        state.external = true;
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_collects_options() {
        let parent = Urn::new("s", "p", None, "my:Component", "c");
        let args = RegisterResource::custom("pkg:m:T", "a")
            .input("foo", "bar")
            .parent(&parent)
            .protect(true)
            .ignore_changes(&["tags"])
            .alias(Alias::name("old"))
            .import("id-1");
        assert_eq!(args.inputs.get("foo"), Some(&json!("bar")));
        assert_eq!(args.options.parent.as_ref(), Some(&parent));
        assert_eq!(args.options.protect, Some(true));
        assert_eq!(args.options.ignore_changes, vec!["tags"]);
        assert_eq!(args.options.import_id.as_deref(), Some("id-1"));
        assert_eq!(args.options.aliases.len(), 1);
    }

    #[test]
    fn test_transform_rewrites_registration() {
        let transform = Transform::new(|args| {
            args.inputs.insert("tagged".to_string(), json!(true));
            Ok(())
        });
        let mut args = RegisterResource::component("my:C", "c");
        transform.apply(&mut args).unwrap();
        assert_eq!(args.inputs.get("tagged"), Some(&json!(true)));
    }

    #[test]
    fn test_read_goal_is_external() {
        let goal = ReadGoal {
            urn: Urn::new("s", "p", None, "pkg:m:T", "r"),
            ty: "pkg:m:T".to_string(),
            id: "ext-1".to_string(),
            inputs: PropertyMap::new(),
            parent: None,
            provider: None,
            dependencies: Vec::new(),
            version: None,
        };
        let state = goal.to_state();
        assert!(state.external);
        assert_eq!(state.id, "ext-1");
    }
}
