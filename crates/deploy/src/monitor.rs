//! The program-facing end of a deployment.
//!
//! A [`ResourceMonitor`] sends requests over a bounded channel to the
//! deployment loop and blocks until the loop answers. It is cheap to clone,
//! so a program can register from as many threads as it likes.

use crate::error::RegistrationError;
use crate::goal::{ReadResource, RegisterResource, RegisterResponse};
use crate::provider::ConstructResponse;
use ledger::{PropertyMap, ProviderRef, Urn};
use std::sync::mpsc::{SyncSender, sync_channel};

pub(crate) type Reply<T> = SyncSender<T>;

/// A request from the program to the deployment loop.
#[derive(Debug)]
pub(crate) enum Request {
    Register {
        args: RegisterResource,
        reply: Reply<Result<RegisterResponse, RegistrationError>>,
    },
    Read {
        args: ReadResource,
        reply: Reply<Result<RegisterResponse, RegistrationError>>,
    },
    Outputs {
        urn: Urn,
        outputs: PropertyMap,
        reply: Reply<Result<(), RegistrationError>>,
    },
    Invoke {
        token: String,
        args: PropertyMap,
        provider: Option<ProviderRef>,
        reply: Reply<anyhow::Result<PropertyMap>>,
    },
    /// A remote component's construct call returned
    Constructed {
        urn: Urn,
        result: anyhow::Result<ConstructResponse>,
        reply: Reply<Result<RegisterResponse, RegistrationError>>,
    },
    /// The program closure returned; no further requests come from it
    ProgramExited,
}

#[derive(Debug, Clone)]
pub struct ResourceMonitor {
    requests: SyncSender<Request>,
}

impl ResourceMonitor {
    pub(crate) fn new(requests: SyncSender<Request>) -> Self {
        Self { requests }
    }

    /// Send a request and wait for its answer. A closed channel means the
    /// deployment stopped listening.
    fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Request) -> Option<T> {
        let (reply, answer) = sync_channel(1);
        self.requests.send(make(reply)).ok()?;
        answer.recv().ok()
    }

    pub(crate) fn constructed(
        &self,
        urn: Urn,
        result: anyhow::Result<ConstructResponse>,
        reply: Reply<Result<RegisterResponse, RegistrationError>>,
    ) {
        let _ = self.requests.send(Request::Constructed { urn, result, reply });
    }

    pub(crate) fn program_exited(&self) {
        let _ = self.requests.send(Request::ProgramExited);
    }

    /// Declare a resource and wait until it has converged.
    pub fn register(&self, args: RegisterResource) -> Result<RegisterResponse, RegistrationError> {
        self.call(|reply| Request::Register { args, reply })
            .unwrap_or(Err(RegistrationError::Cancelled))
    }

    /// Read an existing resource the program does not manage.
    pub fn read(&self, args: ReadResource) -> Result<RegisterResponse, RegistrationError> {
        self.call(|reply| Request::Read { args, reply })
            .unwrap_or(Err(RegistrationError::Cancelled))
    }

    /// Attach outputs to a resource that was already registered, usually a
    /// component once its children are in place.
    pub fn register_outputs(&self, urn: &Urn, outputs: PropertyMap) -> Result<(), RegistrationError> {
        self.call(|reply| Request::Outputs {
            urn: urn.clone(),
            outputs,
            reply,
        })
        .unwrap_or(Err(RegistrationError::Cancelled))
    }

    /// Call a provider function. `None` uses the default provider of the
    /// token's package.
    pub fn invoke(
        &self,
        token: impl Into<String>,
        args: PropertyMap,
        provider: Option<ProviderRef>,
    ) -> anyhow::Result<PropertyMap> {
        let token = token.into();
        self.call(|reply| Request::Invoke {
            token,
            args,
            provider,
            reply,
        })
        .unwrap_or_else(|| Err(anyhow::Error::new(RegistrationError::Cancelled)))
    }
}
