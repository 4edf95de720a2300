//! # Deploy
//!
//! The reconciliation engine: takes resources a program declares, compares
//! them with the last recorded snapshot, and converges the two through
//! providers.
//!
//! ## Core Concepts
//!
//! - **Program**: a closure that registers resources through a [`ResourceMonitor`]
//! - **Goal**: a registration resolved by [`Intake`] into a URN and options
//! - **Steps**: what [`StepGenerator`] decides must happen to reach a goal
//! - **Chains**: the steps of one registration, run in order by the [`Scheduler`]
//! - **Journal**: every step transition, replayed by `ledger` into the next snapshot
//!
//! ## Example
//!
//! ```ignore
//! use deploy::{Deployment, DeploymentOptions, RegisterResource, StaticHost};
//! use ledger::Snapshot;
//! use std::sync::Arc;
//!
//! let host = StaticHost::new().with("aws", Arc::new(my_aws_provider));
//! let options = DeploymentOptions {
//!     stack: "dev".into(),
//!     project: "site".into(),
//!     ..DeploymentOptions::default()
//! };
//!
//! let result = Deployment::new(Snapshot::load(path)?, Arc::new(host), options).run(|monitor| {
//!     let bucket = monitor.register(RegisterResource::custom("aws:s3:Bucket", "assets"))?;
//!     monitor.register(
//!         RegisterResource::custom("aws:s3:Object", "index")
//!             .input("bucket", bucket.id.as_str())
//!             .depends_on(&bucket.urn),
//!     )?;
//!     Ok(())
//! });
//! result.snapshot.save(path)?;
//! ```

pub mod deployment;
pub mod error;
pub mod events;
pub mod executor;
pub mod generator;
pub mod goal;
pub mod graph;
pub mod intake;
pub mod monitor;
pub mod provider;
pub mod registry;
pub mod scheduler;
pub mod views;

#[cfg(test)]
mod testing;

pub use deployment::{Deployment, DeploymentOptions, RunResult};
pub use error::{Diagnostic, DiagnosticKind, Error, ErrorCategory, RegistrationError, Result, Severity};
pub use events::{EventSink, LogEvents, NoEvents, ResourceChanges, StepStatus};
pub use goal::{
    Alias, AliasParent, AliasSpec, ReadResource, RegisterResource, RegisterResponse, ResourceOptions, Transform,
};
pub use monitor::ResourceMonitor;
pub use provider::{
    ConstructRequest, ConstructResponse, CreateRequest, CreateResponse, DeleteRequest, DiffChanges, DiffRequest,
    DiffResponse, MigrateRequest, MigrateResponse, PropertyDiff, PropertyDiffKind, Provider, ProviderHost,
    ReadRequest, ReadResponse, StaticHost, Status, UpdateRequest, UpdateResponse, ViewOp, ViewPublisher, ViewState,
    ViewStep,
};
pub use registry::default_provider_name;
