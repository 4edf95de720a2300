//! Provider interface.
//!
//! A provider manages the resources of one package. The engine never talks to
//! the external system directly: every create, read, update and delete goes
//! through this trait, which keeps the engine testable with in-memory fakes.

use crate::goal::ResourceOptions;
use crate::monitor::ResourceMonitor;
use anyhow::Result;
use ledger::{PropertyMap, Urn};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Outcome reported alongside a provider response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Ok,
    /// Nothing is known about what happened
    Unknown,
    /// The operation partly succeeded; the response describes what exists
    PartialFailure,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::Unknown => "unknown",
            Status::PartialFailure => "partial-failure",
        }
    }
}

// ============================================================================
// Diff
// ============================================================================

/// Coarse classification of a diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiffChanges {
    None,
    Some,
    /// The provider did not compute a diff
    #[default]
    Unknown,
}

/// How one property changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyDiffKind {
    Add,
    AddReplace,
    Update,
    UpdateReplace,
    Delete,
    DeleteReplace,
}

impl PropertyDiffKind {
    pub fn is_replace(&self) -> bool {
        matches!(
            self,
            Self::AddReplace | Self::UpdateReplace | Self::DeleteReplace
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyDiff {
    pub kind: PropertyDiffKind,
    /// Whether the diff is between inputs rather than old outputs
    pub input_diff: bool,
}

#[derive(Debug, Clone)]
pub struct DiffRequest {
    pub urn: Urn,
    pub id: String,
    pub old_inputs: PropertyMap,
    pub old_outputs: PropertyMap,
    pub new_inputs: PropertyMap,
    pub ignore_changes: Vec<String>,
    pub old_views: Vec<ViewState>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffResponse {
    pub changes: DiffChanges,
    /// Changed properties that force a replacement
    pub replace_keys: Vec<String>,
    /// Outputs guaranteed not to change if the resource is updated
    pub stable_keys: Vec<String>,
    pub changed_keys: Vec<String>,
    pub detailed_diff: BTreeMap<String, PropertyDiff>,
    /// Provider asks for the old resource to go before the new one is created
    pub delete_before_replace: bool,
}

impl DiffResponse {
    pub fn none() -> Self {
        Self {
            changes: DiffChanges::None,
            ..Self::default()
        }
    }

    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn some(changed_keys: &[&str]) -> Self {
        Self {
            changes: DiffChanges::Some,
            changed_keys: changed_keys.iter().map(ToString::to_string).collect(),
            ..Self::default()
        }
    }

    pub fn replace(replace_keys: &[&str]) -> Self {
        Self {
            changes: DiffChanges::Some,
            replace_keys: replace_keys.iter().map(ToString::to_string).collect(),
            changed_keys: replace_keys.iter().map(ToString::to_string).collect(),
            ..Self::default()
        }
    }

    pub fn with_delete_before_replace(mut self) -> Self {
        self.delete_before_replace = true;
        self
    }

    /// Replace keys, including properties the detailed diff marks as replacing.
    pub fn all_replace_keys(&self) -> Vec<String> {
        let mut keys = self.replace_keys.clone();
        for (key, diff) in &self.detailed_diff {
            if diff.kind.is_replace() && !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        keys
    }

    /// Every property reported as changed, from either field.
    pub fn all_changed_keys(&self) -> Vec<String> {
        let mut keys = self.changed_keys.clone();
        for key in self.detailed_diff.keys().chain(&self.replace_keys) {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        keys
    }
}

// ============================================================================
// Views
// ============================================================================

/// State of a view as the provider sees it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ViewState {
    pub ty: String,
    pub name: String,
    pub inputs: PropertyMap,
    pub outputs: PropertyMap,
}

/// Lifecycle operation a provider reports for one of its views.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewOp {
    Same,
    Create,
    Update,
    Delete,
    Replace,
}

/// A view lifecycle change published during an owner's provider call.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewStep {
    pub op: ViewOp,
    pub status: Status,
    pub old: Option<ViewState>,
    pub new: Option<ViewState>,
    pub error: Option<String>,
}

impl ViewStep {
    pub fn create(new: ViewState) -> Self {
        Self {
            op: ViewOp::Create,
            status: Status::Ok,
            old: None,
            new: Some(new),
            error: None,
        }
    }

    pub fn update(old: ViewState, new: ViewState) -> Self {
        Self {
            op: ViewOp::Update,
            status: Status::Ok,
            old: Some(old),
            new: Some(new),
            error: None,
        }
    }

    pub fn delete(old: ViewState) -> Self {
        Self {
            op: ViewOp::Delete,
            status: Status::Ok,
            old: Some(old),
            new: None,
            error: None,
        }
    }

    /// Type and name of the view this step acts on.
    pub fn identity(&self) -> Option<(&str, &str)> {
        self.new
            .as_ref()
            .or(self.old.as_ref())
            .map(|view| (view.ty.as_str(), view.name.as_str()))
    }
}

/// Channel a provider uses to report view changes out of band.
#[derive(Clone, Default)]
pub struct ViewPublisher {
    steps: Arc<Mutex<Vec<ViewStep>>>,
}

impl ViewPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, step: ViewStep) {
        self.steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(step);
    }

    pub(crate) fn take(&self) -> Vec<ViewStep> {
        std::mem::take(&mut *self.steps.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl fmt::Debug for ViewPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewPublisher").finish_non_exhaustive()
    }
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub urn: Urn,
    pub inputs: PropertyMap,
    /// Seconds, from the resource's custom timeouts
    pub timeout: Option<u64>,
    pub views: ViewPublisher,
}

#[derive(Debug, Clone, Default)]
pub struct CreateResponse {
    pub id: String,
    pub outputs: PropertyMap,
    pub status: Status,
}

#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub urn: Urn,
    pub id: String,
    pub old_inputs: PropertyMap,
    pub old_outputs: PropertyMap,
    pub new_inputs: PropertyMap,
    pub ignore_changes: Vec<String>,
    pub timeout: Option<u64>,
    pub old_views: Vec<ViewState>,
    pub views: ViewPublisher,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateResponse {
    pub outputs: PropertyMap,
    pub status: Status,
}

#[derive(Debug, Clone)]
pub struct DeleteRequest {
    pub urn: Urn,
    pub id: String,
    pub inputs: PropertyMap,
    pub outputs: PropertyMap,
    pub timeout: Option<u64>,
    pub old_views: Vec<ViewState>,
    pub views: ViewPublisher,
}

#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub urn: Urn,
    pub id: String,
    /// Last known inputs, when refreshing a managed resource
    pub inputs: Option<PropertyMap>,
    pub outputs: Option<PropertyMap>,
    pub old_views: Vec<ViewState>,
    pub views: ViewPublisher,
}

/// An empty `id` means the resource does not exist.
#[derive(Debug, Clone, Default)]
pub struct ReadResponse {
    pub id: String,
    pub inputs: PropertyMap,
    pub outputs: PropertyMap,
    pub status: Status,
}

#[derive(Debug, Clone)]
pub struct MigrateRequest {
    pub urn: Urn,
    pub old_type: String,
    pub new_type: String,
    pub id: String,
    pub old_inputs: PropertyMap,
    pub old_outputs: PropertyMap,
    pub old_property_dependencies: BTreeMap<String, Vec<Urn>>,
    /// `None` if the old registration did not pin a version
    pub old_version: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MigrateResponse {
    pub id: String,
    pub inputs: PropertyMap,
    pub outputs: PropertyMap,
    pub property_dependencies: BTreeMap<String, Vec<Urn>>,
}

#[derive(Debug, Clone)]
pub struct ConstructRequest {
    pub ty: String,
    pub name: String,
    pub parent: Option<Urn>,
    pub inputs: PropertyMap,
    pub options: ResourceOptions,
    /// Monitor the provider registers the component and its children with
    pub monitor: ResourceMonitor,
}

#[derive(Debug, Clone)]
pub struct ConstructResponse {
    pub urn: Urn,
    pub outputs: PropertyMap,
}

// ============================================================================
// Traits
// ============================================================================

/// Operations the engine needs from a provider.
///
/// `create`, `update`, `delete` and `read` are required. The rest have
/// defaults: `diff` reports [`DiffChanges::Unknown`] so the engine compares
/// inputs itself, and `migrate` returns the old state unchanged.
pub trait Provider: Send + Sync {
    fn diff(&self, _request: DiffRequest) -> Result<DiffResponse> {
        Ok(DiffResponse::unknown())
    }

    fn create(&self, request: CreateRequest) -> Result<CreateResponse>;

    fn update(&self, request: UpdateRequest) -> Result<UpdateResponse>;

    fn delete(&self, request: DeleteRequest) -> Result<Status>;

    fn read(&self, request: ReadRequest) -> Result<ReadResponse>;

    fn migrate(&self, request: MigrateRequest) -> Result<MigrateResponse> {
        Ok(MigrateResponse {
            id: request.id,
            inputs: request.old_inputs,
            outputs: request.old_outputs,
            property_dependencies: request.old_property_dependencies,
        })
    }

    fn invoke(&self, token: &str, _args: PropertyMap) -> Result<PropertyMap> {
        anyhow::bail!("provider does not implement invoke ({token})")
    }

    fn construct(&self, request: ConstructRequest) -> Result<ConstructResponse> {
        anyhow::bail!("provider does not implement construct ({})", request.ty)
    }

    fn get_schema(&self) -> Result<serde_json::Value> {
        anyhow::bail!("provider does not implement get_schema")
    }
}

/// Loads provider instances.
pub trait ProviderHost: Send + Sync {
    fn load(&self, package: &str, version: Option<&str>, config: &PropertyMap) -> Result<Arc<dyn Provider>>;
}

/// Host that hands out pre-built providers by package name.
#[derive(Default, Clone)]
pub struct StaticHost {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl StaticHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, package: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.providers.insert(package.into(), provider);
        self
    }
}

impl ProviderHost for StaticHost {
    fn load(&self, package: &str, _version: Option<&str>, _config: &PropertyMap) -> Result<Arc<dyn Provider>> {
        self.providers
            .get(package)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no provider registered for package {package}"))
    }
}
