//! crypto-handles: reference-counted ownership of native cryptographic
//! provider handles and an incremental hash session built on them.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: make the lifetime rules of an external crypto library's handles
//!   explicit in types, so that every increment of a provider's reference
//!   count is matched by exactly one decrement and children are always
//!   destroyed before the provider they were created under.
//! - Layers:
//!   - `native`: opaque ids, raw status codes and the `CryptoProvider`
//!     capability trait. No ownership.
//!   - `tokens`: linear `Token`s minted by `NativeCount::get` (add_ref) and
//!     consumed by `NativeCount::put` (release). A token that is dropped
//!     instead of put panics.
//!   - `ProviderHandle`: one owner of one provider reference. `duplicate`
//!     makes another owner; `release` returns this owner's reference.
//!   - `ChildHandle<K>`: exclusive owner of a hash context or key plus an
//!     optional back-reference to its provider. Release destroys the child,
//!     then returns the back-reference.
//!   - `HashSession`: the `Uninitialized → Initialized → Accumulating →
//!     Finalized` state machine over one provider and one hash child.
//!   - `HashAlgorithmFacade`: initialize/update/finalize/compute_hash for a
//!     fixed SHA-2 algorithm.
//!
//! Constraints
//! - Handles are `Send + Sync`. The increment-then-store of `duplicate` and
//!   `set_parent`, and the destroy-then-decrement of `release`, each run
//!   under the owning handle's lock.
//! - Release is fail-safe: a handle is closed after its first release
//!   whatever the native calls reported, and later use fails with
//!   `Error::InvalidState`.
//! - Both release steps of a child always run; the first failure is the
//!   one reported.
//! - Sessions take `&mut self` for every mutating call; a session has one
//!   logical owner.
//!
//! Provider side
//! - `SoftwareProvider` is an in-process `CryptoProvider` backed by `sha2`.
//!   It keeps provider entries in a `CountedTable` (per-entry counts atop a
//!   generational `HandleTable`) so stale ids never alias live objects, and
//!   offers fault injection and count diagnostics for tests.
//!
//! Notes and non-goals
//! - No subscriber is installed; events go through `tracing`.
//! - Cancellation and timeouts are not modelled; every call is synchronous.
//! - Reference-count overflow inside a provider is not checked.

pub mod child;
pub mod config;
pub mod counted_table;
pub mod error;
pub mod facade;
pub mod handle_table;
pub mod native;
pub mod provider_handle;
pub mod session;
pub mod software;
pub mod tokens;

// Public surface
pub use child::{ChildHandle, HashHandle, HashKind, KeyHandle, KeyKind, ResourceKind};
pub use config::{HashAlgorithm, ProviderConfig};
pub use error::{Error, Result};
pub use facade::HashAlgorithmFacade;
pub use native::{CryptoProvider, RawHash, RawKey, RawProvider, Status};
pub use provider_handle::ProviderHandle;
pub use session::{HashContextView, HashSession, SessionState};
pub use software::{Fault, SoftwareProvider};
