//! Steps: single provider-facing operations with their before/after state.

use crate::state::ResourceState;
use crate::urn::Urn;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Operation tag of a [`Step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepOp {
    Same,
    Create,
    CreateReplacement,
    Update,
    Delete,
    DeleteReplaced,
    Replace,
    Read,
    ReadReplacement,
    ReadDiscard,
    Import,
    ImportReplacement,
    Refresh,
    DiscardReplaced,
}

impl StepOp {
    pub const ALL: [StepOp; 14] = [
        StepOp::Same,
        StepOp::Create,
        StepOp::CreateReplacement,
        StepOp::Update,
        StepOp::Delete,
        StepOp::DeleteReplaced,
        StepOp::Replace,
        StepOp::Read,
        StepOp::ReadReplacement,
        StepOp::ReadDiscard,
        StepOp::Import,
        StepOp::ImportReplacement,
        StepOp::Refresh,
        StepOp::DiscardReplaced,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepOp::Same => "same",
            StepOp::Create => "create",
            StepOp::CreateReplacement => "create-replacement",
            StepOp::Update => "update",
            StepOp::Delete => "delete",
            StepOp::DeleteReplaced => "delete-replaced",
            StepOp::Replace => "replace",
            StepOp::Read => "read",
            StepOp::ReadReplacement => "read-replacement",
            StepOp::ReadDiscard => "read-discard",
            StepOp::Import => "import",
            StepOp::ImportReplacement => "import-replacement",
            StepOp::Refresh => "refresh",
            StepOp::DiscardReplaced => "discard-replaced",
        }
    }

    /// Sub-steps of a replacement; the `Replace` marker is counted instead.
    pub fn is_replacement_part(&self) -> bool {
        matches!(
            self,
            StepOp::CreateReplacement
                | StepOp::DeleteReplaced
                | StepOp::ReadReplacement
                | StepOp::ImportReplacement
                | StepOp::DiscardReplaced
        )
    }

    /// Whether applying the step touches the external system.
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            StepOp::Same | StepOp::Replace | StepOp::ReadDiscard | StepOp::DiscardReplaced
        )
    }
}

impl fmt::Display for StepOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One operation with the record(s) it consumes and produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Step {
    /// Carry a resource forward unchanged
    Same {
        old: Box<ResourceState>,
        new: Box<ResourceState>,
    },
    Create {
        new: Box<ResourceState>,
    },
    /// Create the successor of `old`, which becomes pending-delete
    CreateReplacement {
        old: Box<ResourceState>,
        new: Box<ResourceState>,
    },
    Update {
        old: Box<ResourceState>,
        new: Box<ResourceState>,
    },
    Delete {
        old: Box<ResourceState>,
    },
    /// Delete the predecessor of a replacement
    DeleteReplaced {
        old: Box<ResourceState>,
    },
    /// Marker between the halves of a replacement
    Replace {
        old: Box<ResourceState>,
        new: Box<ResourceState>,
    },
    Read {
        old: Option<Box<ResourceState>>,
        new: Box<ResourceState>,
    },
    ReadReplacement {
        old: Box<ResourceState>,
        new: Box<ResourceState>,
    },
    /// Stop tracking an external resource
    ReadDiscard {
        old: Box<ResourceState>,
    },
    Import {
        new: Box<ResourceState>,
    },
    ImportReplacement {
        old: Box<ResourceState>,
        new: Box<ResourceState>,
    },
    /// `new` is `None` when the resource no longer exists
    Refresh {
        old: Box<ResourceState>,
        new: Option<Box<ResourceState>>,
    },
    /// Forget a superseded record without touching the external system
    DiscardReplaced {
        old: Box<ResourceState>,
    },
}

impl Step {
    pub fn op(&self) -> StepOp {
        match self {
            Step::Same { .. } => StepOp::Same,
            Step::Create { .. } => StepOp::Create,
            Step::CreateReplacement { .. } => StepOp::CreateReplacement,
            Step::Update { .. } => StepOp::Update,
            Step::Delete { .. } => StepOp::Delete,
            Step::DeleteReplaced { .. } => StepOp::DeleteReplaced,
            Step::Replace { .. } => StepOp::Replace,
            Step::Read { .. } => StepOp::Read,
            Step::ReadReplacement { .. } => StepOp::ReadReplacement,
            Step::ReadDiscard { .. } => StepOp::ReadDiscard,
            Step::Import { .. } => StepOp::Import,
            Step::ImportReplacement { .. } => StepOp::ImportReplacement,
            Step::Refresh { .. } => StepOp::Refresh,
            Step::DiscardReplaced { .. } => StepOp::DiscardReplaced,
        }
    }

    pub fn old(&self) -> Option<&ResourceState> {
        match self {
            Step::Same { old, .. }
            | Step::CreateReplacement { old, .. }
            | Step::Update { old, .. }
            | Step::Delete { old }
            | Step::DeleteReplaced { old }
            | Step::Replace { old, .. }
            | Step::ReadReplacement { old, .. }
            | Step::ReadDiscard { old }
            | Step::ImportReplacement { old, .. }
            | Step::Refresh { old, .. }
            | Step::DiscardReplaced { old } => Some(old.as_ref()),
            Step::Read { old, .. } => old.as_deref(),
            Step::Create { .. } | Step::Import { .. } => None,
        }
    }

    pub fn new_state(&self) -> Option<&ResourceState> {
        match self {
            Step::Same { new, .. }
            | Step::Create { new }
            | Step::CreateReplacement { new, .. }
            | Step::Update { new, .. }
            | Step::Replace { new, .. }
            | Step::Read { new, .. }
            | Step::ReadReplacement { new, .. }
            | Step::Import { new }
            | Step::ImportReplacement { new, .. } => Some(new.as_ref()),
            Step::Refresh { new, .. } => new.as_deref(),
            Step::Delete { .. }
            | Step::DeleteReplaced { .. }
            | Step::ReadDiscard { .. }
            | Step::DiscardReplaced { .. } => None,
        }
    }

    pub fn new_state_mut(&mut self) -> Option<&mut ResourceState> {
        match self {
            Step::Same { new, .. }
            | Step::Create { new }
            | Step::CreateReplacement { new, .. }
            | Step::Update { new, .. }
            | Step::Replace { new, .. }
            | Step::Read { new, .. }
            | Step::ReadReplacement { new, .. }
            | Step::Import { new }
            | Step::ImportReplacement { new, .. } => Some(new.as_mut()),
            Step::Refresh { new, .. } => new.as_deref_mut(),
            Step::Delete { .. }
            | Step::DeleteReplaced { .. }
            | Step::ReadDiscard { .. }
            | Step::DiscardReplaced { .. } => None,
        }
    }

    /// Identity the step acts on (the new URN when the step has one).
    pub fn urn(&self) -> &Urn {
        match self {
            Step::Same { new, .. }
            | Step::Create { new }
            | Step::CreateReplacement { new, .. }
            | Step::Update { new, .. }
            | Step::Replace { new, .. }
            | Step::Read { new, .. }
            | Step::ReadReplacement { new, .. }
            | Step::Import { new }
            | Step::ImportReplacement { new, .. } => &new.urn,
            Step::Delete { old }
            | Step::DeleteReplaced { old }
            | Step::ReadDiscard { old }
            | Step::Refresh { old, .. }
            | Step::DiscardReplaced { old } => &old.urn,
        }
    }

    /// Whether the resource is a view published by its owner's provider.
    pub fn is_view(&self) -> bool {
        self.new_state()
            .or_else(|| self.old())
            .is_some_and(ResourceState::is_view)
    }
}
