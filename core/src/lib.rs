//! Content-addressed hashed object graph: canonical hashing, literalization/deliteralization,
//! mutation ops with causal invalidation, identities, and the `Store` that persists all of it
//! through a pluggable `Backend`.
pub mod collections;
pub mod context;
pub mod error;
pub mod hash;
pub mod identity;
pub mod mutation;
pub mod object;
pub mod relay;
pub mod store;

pub use collections::{Hashable, HashedMap, HashedSet};
pub use context::Context;
pub use error::{Error, Result};
pub use hash::{hash_value, hash_value_seeded, Hash, Number, Value};
pub use identity::Identity;
pub use mutation::{CascadedInvalidateOp, InvalidateAfterOp, MutationOp, MutationOpBase, OpHeader, StoredOp};
pub use object::{
    check_derived_field, derived_id, ClassRegistry, DeliteralizedField, Dependency,
    DependencyKind, FieldValue, HashReference, HashedObject, Literal, Resources,
};
pub use relay::{MutationEvent, MutationEventRelay};
pub use store::{memory::MemoryBackend, Backend, Order, SearchParams, Store, StoreConfig, StoreStatsSnapshot, TerminalOps};
