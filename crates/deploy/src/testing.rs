//! Fakes shared by the engine's unit tests.

use crate::goal::{Goal, RegisterResource};
use crate::intake::Intake;
use crate::provider::{
    ConstructRequest, ConstructResponse, CreateRequest, CreateResponse, DeleteRequest, DiffChanges, DiffRequest,
    DiffResponse, MigrateRequest,
    MigrateResponse, Provider, ReadRequest, ReadResponse, Status, UpdateRequest, UpdateResponse, ViewState,
    ViewStep,
};
use ledger::{PropertyMap, ProviderRef, ResourceState, Urn, changed_keys, provider_type};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

pub(crate) const STACK: &str = "dev";
pub(crate) const PROJECT: &str = "site";
pub(crate) const TYPE: &str = "pkg:m:T";

pub(crate) fn inputs(value: Value) -> PropertyMap {
    match value {
        Value::Object(map) => map.into_iter().collect(),
        _ => PropertyMap::new(),
    }
}

pub(crate) fn urn(name: &str) -> Urn {
    Urn::new(STACK, PROJECT, None, TYPE, name)
}

/// The default provider record for package `pkg`.
pub(crate) fn provider_record() -> ResourceState {
    let ty = provider_type("pkg");
    let mut record = ResourceState::new(Urn::new(STACK, PROJECT, None, &ty, "default_pkg"), ty, true);
    record.id = "prov-id".to_string();
    record
}

pub(crate) fn provider_ref() -> ProviderRef {
    let record = provider_record();
    ProviderRef::new(record.urn, record.id)
}

pub(crate) fn custom_record(name: &str, id: &str, input: Value) -> ResourceState {
    let mut record = ResourceState::new(urn(name), TYPE, true);
    record.id = id.to_string();
    record.inputs = inputs(input);
    record.outputs = record.inputs.clone();
    record.provider = Some(provider_ref());
    record
}

pub(crate) fn custom_goal(name: &str, input: Value) -> Goal {
    let args = RegisterResource::custom(TYPE, name)
        .inputs(inputs(input))
        .provider_ref(provider_ref());
    match Intake::new(STACK, PROJECT).prepare(args) {
        Ok(prepared) => prepared.goal,
        Err(e) => panic!("goal for {name} rejected: {e}"),
    }
}

/// Goal registering the default provider for package `pkg`.
pub(crate) fn provider_goal() -> Goal {
    match Intake::new(STACK, PROJECT).prepare(RegisterResource::provider("pkg", "default_pkg")) {
        Ok(prepared) => prepared.goal,
        Err(e) => panic!("provider goal rejected: {e}"),
    }
}

/// In-memory provider that records every call it receives.
///
/// Created IDs are `<name>-<n>` with a counter shared by all resources.
/// Outputs echo inputs.
#[derive(Default)]
pub(crate) struct FakeProvider {
    replace_keys: Vec<String>,
    delete_before_replace: bool,
    without_diff: bool,
    compared: Option<Vec<String>>,
    reads: HashMap<String, ReadResponse>,
    gone: HashSet<String>,
    failing: HashSet<String>,
    views: Vec<ViewState>,
    counter: AtomicUsize,
    log: Mutex<Vec<String>>,
}

impl FakeProvider {
    pub fn replace_on(mut self, keys: &[&str]) -> Self {
        self.replace_keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn delete_before_replace(mut self) -> Self {
        self.delete_before_replace = true;
        self
    }

    /// Report unknown changes from every diff.
    pub fn without_diff(mut self) -> Self {
        self.without_diff = true;
        self
    }

    /// Diffs only look at these keys.
    pub fn comparing(mut self, keys: &[&str]) -> Self {
        self.compared = Some(keys.iter().map(|k| k.to_string()).collect());
        self
    }

    pub fn reading(mut self, id: &str, response: ReadResponse) -> Self {
        self.reads.insert(id.to_string(), response);
        self
    }

    /// Reads of this ID find nothing.
    pub fn gone(mut self, id: &str) -> Self {
        self.gone.insert(id.to_string());
        self
    }

    /// Create and update of this resource name fail.
    pub fn failing(mut self, name: &str) -> Self {
        self.failing.insert(name.to_string());
        self
    }

    /// Views published by every create.
    pub fn with_views(mut self, views: Vec<ViewState>) -> Self {
        self.views = views;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    fn record(&self, call: String) {
        if let Ok(mut log) = self.log.lock() {
            log.push(call);
        }
    }
}

impl Provider for FakeProvider {
    fn diff(&self, request: DiffRequest) -> anyhow::Result<DiffResponse> {
        self.record(format!("diff:{}", request.urn.name()));
        if self.without_diff {
            return Ok(DiffResponse::unknown());
        }
        let changed: Vec<String> = changed_keys(&request.old_inputs, &request.new_inputs)
            .into_iter()
            .filter(|key| !request.ignore_changes.contains(key))
            .filter(|key| self.compared.as_ref().is_none_or(|keys| keys.contains(key)))
            .collect();
        if changed.is_empty() {
            return Ok(DiffResponse::none());
        }
        let replace: Vec<String> = changed
            .iter()
            .filter(|key| self.replace_keys.contains(key))
            .cloned()
            .collect();
        Ok(DiffResponse {
            changes: DiffChanges::Some,
            delete_before_replace: self.delete_before_replace && !replace.is_empty(),
            replace_keys: replace,
            changed_keys: changed,
            ..DiffResponse::default()
        })
    }

    fn create(&self, request: CreateRequest) -> anyhow::Result<CreateResponse> {
        let name = request.urn.name().to_string();
        self.record(format!("create:{name}"));
        if self.failing.contains(&name) {
            anyhow::bail!("create of {name} refused");
        }
        for view in &self.views {
            request.views.publish(ViewStep::create(view.clone()));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(CreateResponse {
            id: format!("{name}-{n}"),
            outputs: request.inputs,
            status: Status::Ok,
        })
    }

    fn update(&self, request: UpdateRequest) -> anyhow::Result<UpdateResponse> {
        let name = request.urn.name().to_string();
        self.record(format!("update:{name}"));
        if self.failing.contains(&name) {
            anyhow::bail!("update of {name} refused");
        }
        Ok(UpdateResponse {
            outputs: request.new_inputs,
            status: Status::Ok,
        })
    }

    fn delete(&self, request: DeleteRequest) -> anyhow::Result<Status> {
        self.record(format!("delete:{}:{}", request.urn.name(), request.id));
        Ok(Status::Ok)
    }

    fn read(&self, request: ReadRequest) -> anyhow::Result<ReadResponse> {
        self.record(format!("read:{}:{}", request.urn.name(), request.id));
        if self.gone.contains(&request.id) {
            return Ok(ReadResponse::default());
        }
        if let Some(response) = self.reads.get(&request.id) {
            return Ok(response.clone());
        }
        Ok(ReadResponse {
            id: request.id,
            inputs: request.inputs.unwrap_or_default(),
            outputs: request.outputs.unwrap_or_default(),
            status: Status::Ok,
        })
    }

    fn migrate(&self, request: MigrateRequest) -> anyhow::Result<MigrateResponse> {
        self.record(format!(
            "migrate:{}:{}",
            request.urn.name(),
            request.old_version.as_deref().unwrap_or("-")
        ));
        Ok(MigrateResponse {
            id: request.id,
            inputs: request.old_inputs,
            outputs: request.old_outputs,
            property_dependencies: request.old_property_dependencies,
        })
    }

    /// Echoes its arguments.
    fn invoke(&self, token: &str, args: PropertyMap) -> anyhow::Result<PropertyMap> {
        self.record(format!("invoke:{token}"));
        Ok(args)
    }

    /// Registers the component and one `<name>-part` child under it.
    fn construct(&self, request: ConstructRequest) -> anyhow::Result<ConstructResponse> {
        self.record(format!("construct:{}", request.name));
        let mut component = RegisterResource::component(request.ty, request.name.clone());
        if let Some(parent) = &request.parent {
            component = component.parent(parent);
        }
        let component = request.monitor.register(component)?;
        request.monitor.register(
            RegisterResource::custom(TYPE, format!("{}-part", request.name)).parent(&component.urn),
        )?;
        Ok(ConstructResponse {
            urn: component.urn,
            outputs: request.inputs,
        })
    }
}
