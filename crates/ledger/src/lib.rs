//! # ledger
//!
//! Resource state snapshots and the journal that rebuilds them.
//!
//! A [`Snapshot`] is the ordered list of resources last known to exist. While a
//! deployment runs, every step lifecycle transition is appended to a
//! [`Journal`]; [`replay`] folds those entries onto the snapshot the run started
//! from. Because the fold is valid after any number of entries, a run that dies
//! half way can always be resumed from what was journaled.
//!
//! ## Quick Start
//!
//! ```
//! use ledger::{Journal, ResourceState, Snapshot, Step, Urn, replay};
//!
//! let base = Snapshot::default();
//! let journal = Journal::new();
//!
//! let urn = Urn::new("dev", "site", None, "my:Component", "web");
//! let step = Step::Create {
//!     new: Box::new(ResourceState::new(urn.clone(), "my:Component", false)),
//! };
//! let begun = journal.begin(step.clone()).unwrap();
//! journal.end(begun, step, true).unwrap();
//!
//! let snapshot = replay(&base, &journal.entries()).unwrap();
//! assert!(snapshot.get(&urn).is_some());
//! ```

pub mod error;
pub mod journal;
pub mod property;
pub mod replay;
pub mod snapshot;
pub mod state;
pub mod step;
pub mod urn;

pub use error::{Error, ErrorCategory, IntegrityError, ReplayError, Result};
pub use journal::{Journal, JournalEntry, JournalPersister, JsonLinesPersister, Mutation, read_entries};
pub use property::{PropertyMap, PropertyValue, changed_keys, property_map};
pub use replay::{Replayer, replay};
pub use snapshot::{Manifest, OperationKind, PendingOperation, Snapshot};
pub use state::{CustomTimeouts, ResourceState};
pub use step::{Step, StepOp};
pub use urn::{ProviderRef, Urn, is_provider_type, package_of, provider_type};
