//! In-process `CryptoProvider` backed by the `sha2` crate.
//!
//! Provider entries are shared per algorithm: every `open` of the same
//! algorithm returns the same id and adds a reference, and the entry is
//! destroyed when the last reference is released. Hash contexts and keys
//! live in generational tables so destroyed ids stay invalid.
//!
//! The provider also exposes fault injection and reference-count
//! diagnostics, which is what the crate's own tests use to exercise
//! release ordering and best-effort cleanup.

use hashbrown::HashMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256, Sha384, Sha512};
use slotmap::{DefaultKey, SlotMap};
use tracing::trace;
use zeroize::Zeroizing;

use crate::config::HashAlgorithm;
use crate::counted_table::{CountedTable, PutResult};
use crate::handle_table::Slot;
use crate::native::{CryptoProvider, RawHash, RawKey, RawProvider, Status};

/// Implementation name accepted by [`SoftwareProvider::open`].
pub const SOFTWARE_IMPLEMENTATION: &str = "software";

/// A provider call that can be made to fail on demand.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Fault {
    Open,
    AddRef,
    Release,
    CreateHash,
    HashUpdate,
    HashFinish,
    DestroyHash,
    ImportKey,
    DuplicateKey,
    DestroyKey,
}

enum HashState {
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl HashState {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha256 => HashState::Sha256(Sha256::new()),
            HashAlgorithm::Sha384 => HashState::Sha384(Sha384::new()),
            HashAlgorithm::Sha512 => HashState::Sha512(Sha512::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            HashState::Sha256(h) => h.update(data),
            HashState::Sha384(h) => h.update(data),
            HashState::Sha512(h) => h.update(data),
        }
    }

    fn finish(&mut self) -> Vec<u8> {
        match self {
            HashState::Sha256(h) => h.finalize_reset().to_vec(),
            HashState::Sha384(h) => h.finalize_reset().to_vec(),
            HashState::Sha512(h) => h.finalize_reset().to_vec(),
        }
    }
}

struct HashContext {
    provider: RawProvider,
    state: HashState,
    finished: bool,
}

struct KeyObject {
    provider: RawProvider,
    material: Zeroizing<Vec<u8>>,
}

struct Tables {
    providers: CountedTable<HashAlgorithm, ()>,
    hashes: SlotMap<DefaultKey, HashContext>,
    keys: SlotMap<DefaultKey, KeyObject>,
    faults: HashMap<Fault, u32>,
}

impl Tables {
    /// Consume one pending fault for `op`, if any.
    fn trip(&mut self, op: Fault) -> bool {
        match self.faults.get_mut(&op) {
            Some(n) if *n > 0 => {
                *n -= 1;
                trace!(?op, "injected fault");
                true
            }
            _ => false,
        }
    }

    fn provider_algorithm(&self, provider: RawProvider) -> Result<HashAlgorithm, Status> {
        let slot = Slot::from_id(provider.0).ok_or(Status::INVALID_HANDLE)?;
        self.providers
            .key(slot)
            .copied()
            .ok_or(Status::INVALID_HANDLE)
    }
}

fn child_key(id: u64) -> Option<DefaultKey> {
    Slot::from_id(id).map(|s| s.raw_key())
}

/// Software reference implementation of [`CryptoProvider`].
pub struct SoftwareProvider {
    tables: Mutex<Tables>,
}

impl SoftwareProvider {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables {
                providers: CountedTable::new(),
                hashes: SlotMap::with_key(),
                keys: SlotMap::with_key(),
                faults: HashMap::new(),
            }),
        }
    }

    /// Make the next call of kind `op` fail. Repeated calls queue further
    /// failures.
    pub fn inject_fault(&self, op: Fault) {
        *self.tables.lock().faults.entry(op).or_insert(0) += 1;
    }

    /// Drop all pending injected faults.
    pub fn clear_faults(&self) {
        self.tables.lock().faults.clear();
    }

    /// Current reference count of a provider id; zero once destroyed.
    pub fn ref_count(&self, provider: RawProvider) -> usize {
        match Slot::from_id(provider.0) {
            Some(slot) => self.tables.lock().providers.count(slot),
            None => 0,
        }
    }

    /// Number of live provider entries.
    pub fn live_providers(&self) -> usize {
        self.tables.lock().providers.len()
    }

    /// Number of live hash contexts.
    pub fn live_hashes(&self) -> usize {
        self.tables.lock().hashes.len()
    }

    /// Number of live key objects.
    pub fn live_keys(&self) -> usize {
        self.tables.lock().keys.len()
    }

    /// Whether two key ids hold identical material.
    pub fn same_key_material(&self, a: RawKey, b: RawKey) -> bool {
        let tables = self.tables.lock();
        let lookup = |k: RawKey| child_key(k.0).and_then(|key| tables.keys.get(key));
        match (lookup(a), lookup(b)) {
            (Some(x), Some(y)) => x.material[..] == y.material[..],
            _ => false,
        }
    }

    /// The provider id a hash context was created under.
    pub fn hash_parent(&self, hash: RawHash) -> Option<RawProvider> {
        let tables = self.tables.lock();
        child_key(hash.0)
            .and_then(|k| tables.hashes.get(k))
            .map(|h| h.provider)
    }

    /// The provider id a key was created under.
    pub fn key_parent(&self, key: RawKey) -> Option<RawProvider> {
        let tables = self.tables.lock();
        child_key(key.0)
            .and_then(|k| tables.keys.get(k))
            .map(|k| k.provider)
    }
}

impl Default for SoftwareProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoProvider for SoftwareProvider {
    fn open(&self, algorithm: &str, implementation: Option<&str>) -> Result<RawProvider, Status> {
        let mut tables = self.tables.lock();
        if tables.trip(Fault::Open) {
            return Err(Status::NO_MEMORY);
        }
        if let Some(name) = implementation {
            if !name.eq_ignore_ascii_case(SOFTWARE_IMPLEMENTATION) {
                return Err(Status::NOT_FOUND);
            }
        }
        let algorithm: HashAlgorithm = algorithm.parse().map_err(|_| Status::NOT_FOUND)?;
        let slot = tables.providers.acquire_with(algorithm, || ());
        trace!(%algorithm, id = slot.to_id(), "open");
        Ok(RawProvider(slot.to_id()))
    }

    fn add_ref(&self, provider: RawProvider) -> bool {
        let mut tables = self.tables.lock();
        if tables.trip(Fault::AddRef) {
            return false;
        }
        match Slot::from_id(provider.0) {
            Some(slot) => tables.providers.get(slot),
            None => false,
        }
    }

    fn release(&self, provider: RawProvider) -> bool {
        let mut tables = self.tables.lock();
        if tables.trip(Fault::Release) {
            return false;
        }
        let Some(slot) = Slot::from_id(provider.0) else {
            return false;
        };
        match tables.providers.put(slot) {
            PutResult::Stale => false,
            PutResult::Live(_) => true,
            PutResult::Removed { key, .. } => {
                trace!(algorithm = %key, id = provider.0, "provider destroyed");
                true
            }
        }
    }

    fn create_hash(&self, provider: RawProvider) -> Result<RawHash, Status> {
        let mut tables = self.tables.lock();
        if tables.trip(Fault::CreateHash) {
            return Err(Status::NO_MEMORY);
        }
        let algorithm = tables.provider_algorithm(provider)?;
        let key = tables.hashes.insert(HashContext {
            provider,
            state: HashState::new(algorithm),
            finished: false,
        });
        Ok(RawHash(Slot::new(key).to_id()))
    }

    fn hash_update(&self, hash: RawHash, data: &[u8]) -> Result<(), Status> {
        let mut tables = self.tables.lock();
        if tables.trip(Fault::HashUpdate) {
            return Err(Status::UNSUCCESSFUL);
        }
        let key = child_key(hash.0).ok_or(Status::INVALID_HANDLE)?;
        let ctx = tables.hashes.get_mut(key).ok_or(Status::INVALID_HANDLE)?;
        if ctx.finished {
            return Err(Status::INVALID_STATE);
        }
        ctx.state.update(data);
        Ok(())
    }

    fn hash_finish(&self, hash: RawHash) -> Result<Vec<u8>, Status> {
        let mut tables = self.tables.lock();
        if tables.trip(Fault::HashFinish) {
            return Err(Status::UNSUCCESSFUL);
        }
        let key = child_key(hash.0).ok_or(Status::INVALID_HANDLE)?;
        let ctx = tables.hashes.get_mut(key).ok_or(Status::INVALID_HANDLE)?;
        if ctx.finished {
            return Err(Status::INVALID_STATE);
        }
        ctx.finished = true;
        Ok(ctx.state.finish())
    }

    fn destroy_hash(&self, hash: RawHash) -> bool {
        let mut tables = self.tables.lock();
        if tables.trip(Fault::DestroyHash) {
            return false;
        }
        match child_key(hash.0) {
            Some(key) => tables.hashes.remove(key).is_some(),
            None => false,
        }
    }

    fn import_key(&self, provider: RawProvider, secret: &[u8]) -> Result<RawKey, Status> {
        let mut tables = self.tables.lock();
        if tables.trip(Fault::ImportKey) {
            return Err(Status::NO_MEMORY);
        }
        tables.provider_algorithm(provider)?;
        if secret.is_empty() {
            return Err(Status::INVALID_PARAMETER);
        }
        let key = tables.keys.insert(KeyObject {
            provider,
            material: Zeroizing::new(secret.to_vec()),
        });
        Ok(RawKey(Slot::new(key).to_id()))
    }

    fn duplicate_key(&self, key: RawKey) -> Result<RawKey, Status> {
        let mut tables = self.tables.lock();
        if tables.trip(Fault::DuplicateKey) {
            return Err(Status::NO_MEMORY);
        }
        let src = child_key(key.0).ok_or(Status::INVALID_HANDLE)?;
        let copy = match tables.keys.get(src) {
            Some(k) => KeyObject {
                provider: k.provider,
                material: k.material.clone(),
            },
            None => return Err(Status::INVALID_HANDLE),
        };
        let dup = tables.keys.insert(copy);
        Ok(RawKey(Slot::new(dup).to_id()))
    }

    fn destroy_key(&self, key: RawKey) -> bool {
        let mut tables = self.tables.lock();
        if tables.trip(Fault::DestroyKey) {
            return false;
        }
        match child_key(key.0) {
            Some(k) => tables.keys.remove(k).is_some(),
            None => false,
        }
    }

    fn key_length(&self, key: RawKey) -> Result<usize, Status> {
        let tables = self.tables.lock();
        let k = child_key(key.0).ok_or(Status::INVALID_HANDLE)?;
        tables
            .keys
            .get(k)
            .map(|obj| obj.material.len())
            .ok_or(Status::INVALID_HANDLE)
    }
}
