//! Raw native identifiers and the capability interface of an external
//! cryptographic provider.
//!
//! Everything in this module is deliberately thin: ids are plain `u64`
//! newtypes with a zero `NULL`, failures are raw status codes, and the
//! [`CryptoProvider`] trait mirrors the C-style calls a platform library
//! exposes. Ownership, ordering and state live one layer up.

use core::fmt;

macro_rules! raw_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl $name {
            /// The null identifier; never names a live native object.
            pub const NULL: Self = Self(0);

            #[inline]
            pub fn is_null(self) -> bool {
                self.0 == 0
            }
        }
    };
}

raw_id!(
    /// Identifier of an open algorithm provider.
    RawProvider
);
raw_id!(
    /// Identifier of a native hash context.
    RawHash
);
raw_id!(
    /// Identifier of a native key object.
    RawKey
);

/// Raw failure code reported by a provider.
///
/// Values follow the NTSTATUS layout used by CNG so codes surfaced from a
/// platform provider can be passed through unchanged.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Status(pub u32);

impl Status {
    pub const UNSUCCESSFUL: Status = Status(0xC000_0001);
    pub const INVALID_HANDLE: Status = Status(0xC000_0008);
    pub const INVALID_PARAMETER: Status = Status(0xC000_000D);
    pub const NO_MEMORY: Status = Status(0xC000_0017);
    pub const NOT_SUPPORTED: Status = Status(0xC000_00BB);
    pub const INVALID_STATE: Status = Status(0xC000_0184);
    pub const NOT_FOUND: Status = Status(0xC000_0225);

    #[inline]
    pub fn code(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Status({:#010X})", self.0)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010X}", self.0)
    }
}

/// Capability interface of an external cryptographic provider.
///
/// Implementations own the real reference counts and native objects. The
/// boolean-returning calls report success only; they carry no code, in the
/// same way the platform's close/destroy functions do.
///
/// Implementations must be safe to call from multiple threads. In
/// particular `add_ref` and `release` on the same provider id must be
/// indivisible with respect to each other.
pub trait CryptoProvider: Send + Sync {
    /// Open a provider for `algorithm`, optionally pinned to a named
    /// implementation. The returned id carries one reference.
    fn open(&self, algorithm: &str, implementation: Option<&str>) -> Result<RawProvider, Status>;

    /// Add one reference to an open provider.
    fn add_ref(&self, provider: RawProvider) -> bool;

    /// Drop one reference; the provider is destroyed when none remain.
    fn release(&self, provider: RawProvider) -> bool;

    /// Create a hash context under `provider`.
    fn create_hash(&self, provider: RawProvider) -> Result<RawHash, Status>;

    /// Append `data` to a hash context.
    fn hash_update(&self, hash: RawHash, data: &[u8]) -> Result<(), Status>;

    /// Finish a hash context and return its digest. The context cannot be
    /// updated or finished again afterwards.
    fn hash_finish(&self, hash: RawHash) -> Result<Vec<u8>, Status>;

    /// Destroy a hash context.
    fn destroy_hash(&self, hash: RawHash) -> bool;

    /// Import raw secret material as a key under `provider`.
    fn import_key(&self, provider: RawProvider, secret: &[u8]) -> Result<RawKey, Status>;

    /// Duplicate a key object; the copy is independently destroyable.
    fn duplicate_key(&self, key: RawKey) -> Result<RawKey, Status>;

    /// Destroy a key object.
    fn destroy_key(&self, key: RawKey) -> bool;

    /// Length in bytes of a key's material.
    fn key_length(&self, key: RawKey) -> Result<usize, Status>;
}
