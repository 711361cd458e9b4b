//! Child handles: native hash contexts and keys created under a provider.
//!
//! A child owns its native object exclusively and, once `set_parent` has
//! succeeded, one reference to the provider it was created from. Release
//! always runs in the same order: destroy the native child, then return
//! the provider reference. The parent reference is what keeps the provider
//! alive for the child; the `ProviderHandle` the child was created from can
//! be released independently.

use core::fmt;
use std::sync::Arc;

use once_cell::race::OnceBox;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::native::{CryptoProvider, RawHash, RawKey, RawProvider};
use crate::provider_handle::ProviderHandle;
use crate::tokens::{Count, NativeCount, Token};

mod sealed {
    pub trait Sealed {}
}

/// The closed set of native child kinds.
pub trait ResourceKind: sealed::Sealed + Sized + Send + Sync + 'static {
    type Raw: Copy + Eq + fmt::Debug + Send + Sync + 'static;

    /// Short name used in errors and logs.
    const NAME: &'static str;
    const NULL: Self::Raw;

    fn is_null(raw: Self::Raw) -> bool;

    /// Destroy the native object. Returns false if the provider refused.
    fn destroy(provider: &dyn CryptoProvider, raw: Self::Raw) -> bool;

    /// Process-wide cell holding this kind's invalid sentinel. Racing
    /// initializers may each build one; only the first published survives.
    #[doc(hidden)]
    fn invalid_cell() -> &'static OnceBox<ChildHandle<Self>>;
}

/// Marker for native hash contexts.
#[derive(Debug)]
pub enum HashKind {}

/// Marker for native key objects.
#[derive(Debug)]
pub enum KeyKind {}

impl sealed::Sealed for HashKind {}
impl sealed::Sealed for KeyKind {}

impl ResourceKind for HashKind {
    type Raw = RawHash;
    const NAME: &'static str = "hash";
    const NULL: RawHash = RawHash::NULL;

    fn is_null(raw: RawHash) -> bool {
        raw.is_null()
    }

    fn destroy(provider: &dyn CryptoProvider, raw: RawHash) -> bool {
        provider.destroy_hash(raw)
    }

    fn invalid_cell() -> &'static OnceBox<ChildHandle<Self>> {
        static CELL: OnceBox<ChildHandle<HashKind>> = OnceBox::new();
        &CELL
    }
}

impl ResourceKind for KeyKind {
    type Raw = RawKey;
    const NAME: &'static str = "key";
    const NULL: RawKey = RawKey::NULL;

    fn is_null(raw: RawKey) -> bool {
        raw.is_null()
    }

    fn destroy(provider: &dyn CryptoProvider, raw: RawKey) -> bool {
        provider.destroy_key(raw)
    }

    fn invalid_cell() -> &'static OnceBox<ChildHandle<Self>> {
        static CELL: OnceBox<ChildHandle<KeyKind>> = OnceBox::new();
        &CELL
    }
}

/// A child's counted reference to its provider.
struct ParentRef {
    count: NativeCount,
    token: Token<'static, NativeCount>,
}

impl ParentRef {
    fn release(self) -> bool {
        let ParentRef { count, token } = self;
        count.put(token)
    }
}

struct ChildState<K: ResourceKind> {
    raw: K::Raw,
    // Write-once: set by `set_parent` or by `duplicate`, taken only by release.
    parent: Option<ParentRef>,
    released: bool,
}

/// Exclusive owner of one native child object.
pub struct ChildHandle<K: ResourceKind> {
    // `None` only for the per-kind invalid sentinel.
    provider: Option<Arc<dyn CryptoProvider>>,
    state: Mutex<ChildState<K>>,
}

pub type HashHandle = ChildHandle<HashKind>;
pub type KeyHandle = ChildHandle<KeyKind>;

impl<K: ResourceKind> ChildHandle<K> {
    /// Take ownership of a native object. No parent reference is held until
    /// `set_parent` succeeds.
    pub fn from_raw(provider: Arc<dyn CryptoProvider>, raw: K::Raw) -> Self {
        Self {
            provider: Some(provider),
            state: Mutex::new(ChildState {
                raw,
                parent: None,
                released: false,
            }),
        }
    }

    /// The shared "no resource" sentinel for this kind. It carries a null
    /// id, owns nothing and ignores `release`.
    pub fn invalid() -> &'static Self {
        K::invalid_cell().get_or_init(|| Box::new(Self::sentinel()))
    }

    fn sentinel() -> Self {
        Self {
            provider: None,
            state: Mutex::new(ChildState {
                raw: K::NULL,
                parent: None,
                released: false,
            }),
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.provider.is_none()
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }

    /// The native id while the handle is live.
    pub fn raw(&self) -> Result<K::Raw> {
        let state = self.state.lock();
        self.live_provider(&state, "raw")?;
        Ok(state.raw)
    }

    /// The provider this child holds a reference to, if any.
    pub fn parent(&self) -> Option<RawProvider> {
        self.state.lock().parent.as_ref().map(|p| p.count.raw())
    }

    /// Record `parent` as this child's provider, taking one reference to it.
    ///
    /// May succeed at most once per handle. If the reference cannot be
    /// taken, nothing is recorded.
    pub fn set_parent(&self, parent: &ProviderHandle) -> Result<()> {
        let mut state = self.state.lock();
        debug_assert!(
            state.parent.is_none(),
            "set_parent called twice on a {} handle",
            K::NAME
        );
        if state.parent.is_some() {
            return Err(Error::InvariantViolation("parent already set"));
        }
        self.live_provider(&state, "set_parent")?;
        let (count, token) = parent.acquire_for_child()?;
        state.parent = Some(ParentRef { count, token });
        Ok(())
    }

    /// Destroy the native object, then return the parent reference.
    ///
    /// The second step runs even if the first fails. Idempotent; the handle
    /// is closed after the first call whatever its outcome.
    pub fn release(&self) -> Result<()> {
        let Some(provider) = &self.provider else {
            return Ok(());
        };
        let mut state = self.state.lock();
        if state.released {
            return Ok(());
        }
        state.released = true;

        let destroyed = K::is_null(state.raw) || K::destroy(provider.as_ref(), state.raw);
        let parent_released = match state.parent.take() {
            Some(parent) => parent.release(),
            None => true,
        };
        debug!(
            kind = K::NAME,
            raw = ?state.raw,
            destroyed,
            parent_released,
            "child released"
        );

        if !destroyed {
            Err(Error::ReleaseFailed {
                resource: K::NAME,
                step: "destroy",
            })
        } else if !parent_released {
            Err(Error::ReleaseFailed {
                resource: K::NAME,
                step: "release parent",
            })
        } else {
            Ok(())
        }
    }

    fn live_provider(&self, state: &ChildState<K>, op: &'static str) -> Result<&Arc<dyn CryptoProvider>> {
        let provider = self
            .provider
            .as_ref()
            .ok_or(Error::InvalidState { op, state: "invalid" })?;
        if state.released {
            return Err(Error::InvalidState {
                op,
                state: "released",
            });
        }
        Ok(provider)
    }
}

impl ChildHandle<HashKind> {
    /// Create a hash context under `parent` and take a parent reference.
    pub fn create(parent: &ProviderHandle) -> Result<Self> {
        let raw = parent
            .provider()
            .create_hash(parent.raw()?)
            .map_err(|status| Error::from_status("create_hash", status))?;
        let child = Self::from_raw(parent.provider().clone(), raw);
        // On failure `child` drops here and destroys the context.
        child.set_parent(parent)?;
        debug!(hash = raw.0, provider = ?child.parent(), "hash created");
        Ok(child)
    }

    pub fn update(&self, data: &[u8]) -> Result<()> {
        let state = self.state.lock();
        let provider = self.live_provider(&state, "hash_update")?;
        provider
            .hash_update(state.raw, data)
            .map_err(|status| Error::from_status("hash_update", status))
    }

    pub fn finish(&self) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let provider = self.live_provider(&state, "hash_finish")?;
        provider
            .hash_finish(state.raw)
            .map_err(|status| Error::from_status("hash_finish", status))
    }
}

impl ChildHandle<KeyKind> {
    /// Import secret material as a key under `parent`.
    pub fn import(parent: &ProviderHandle, secret: &[u8]) -> Result<Self> {
        let raw = parent
            .provider()
            .import_key(parent.raw()?, secret)
            .map_err(|status| Error::from_status("import_key", status))?;
        let child = Self::from_raw(parent.provider().clone(), raw);
        child.set_parent(parent)?;
        Ok(child)
    }

    /// Duplicate the native key into an independently owned handle.
    ///
    /// The copy takes its own reference to the source's provider. If that
    /// fails, the copied key is destroyed and the error returned.
    pub fn duplicate(&self) -> Result<Self> {
        let state = self.state.lock();
        let provider = self.live_provider(&state, "duplicate")?;
        let raw = provider
            .duplicate_key(state.raw)
            .map_err(|status| Error::from_status("duplicate_key", status))?;
        let mut dup = Self::from_raw(provider.clone(), raw);

        // The source's own parent reference keeps the count above zero
        // while we add one for the copy.
        let adopted = state.parent.as_ref().map(|parent| {
            parent.count.get().map(|token| ParentRef {
                count: parent.count.clone(),
                token,
            })
        });
        let source = state.raw;
        drop(state);

        match adopted {
            Some(Ok(parent)) => dup.state.get_mut().parent = Some(parent),
            Some(Err(e)) => {
                if let Err(re) = dup.release() {
                    warn!(?re, key = raw.0, "discarding partial duplicate failed");
                }
                return Err(e);
            }
            None => {}
        }
        debug!(source = source.0, key = raw.0, "key duplicated");
        Ok(dup)
    }

    pub fn key_length(&self) -> Result<usize> {
        let state = self.state.lock();
        let provider = self.live_provider(&state, "key_length")?;
        provider
            .key_length(state.raw)
            .map_err(|status| Error::from_status("key_length", status))
    }
}

impl<K: ResourceKind> fmt::Debug for ChildHandle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ChildHandle")
            .field("kind", &K::NAME)
            .field("raw", &state.raw)
            .field("parent", &state.parent.as_ref().map(|p| p.count.raw()))
            .field("released", &state.released)
            .finish()
    }
}

impl<K: ResourceKind> Drop for ChildHandle<K> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            error!(?e, kind = K::NAME, "child release failed on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::software::{Fault, SoftwareProvider};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    fn open() -> (Arc<SoftwareProvider>, ProviderHandle) {
        let sw = Arc::new(SoftwareProvider::new());
        let p: Arc<dyn CryptoProvider> = sw.clone();
        let h = ProviderHandle::open(p, &ProviderConfig::default()).unwrap();
        (sw, h)
    }

    #[test]
    fn hash_holds_parent_reference_past_provider_release() {
        let (sw, provider) = open();
        let raw = provider.raw().unwrap();
        let hash = HashHandle::create(&provider).unwrap();
        assert_eq!(sw.ref_count(raw), 2);
        assert_eq!(hash.parent(), Some(raw));

        provider.release().unwrap();
        assert_eq!(sw.ref_count(raw), 1);
        hash.update(b"still usable").unwrap();

        hash.release().unwrap();
        assert_eq!(sw.ref_count(raw), 0);
        assert_eq!(sw.live_hashes(), 0);
    }

    #[test]
    fn release_is_idempotent() {
        let (sw, provider) = open();
        let raw = provider.raw().unwrap();
        let hash = HashHandle::create(&provider).unwrap();
        hash.release().unwrap();
        hash.release().unwrap();
        assert!(hash.is_released());
        assert_eq!(sw.ref_count(raw), 1);
        assert!(hash.raw().unwrap_err().is_invalid_state());
    }

    #[test]
    fn failed_destroy_still_releases_parent() {
        let (sw, provider) = open();
        let raw = provider.raw().unwrap();
        let hash = HashHandle::create(&provider).unwrap();
        sw.inject_fault(Fault::DestroyHash);
        assert_eq!(
            hash.release(),
            Err(Error::ReleaseFailed {
                resource: "hash",
                step: "destroy"
            })
        );
        assert_eq!(sw.ref_count(raw), 1);
        assert!(hash.is_released());
    }

    #[test]
    fn child_without_parent_releases_only_itself() {
        let (sw, provider) = open();
        let raw = provider.raw().unwrap();
        let native = sw.create_hash(raw).unwrap();
        let provider_dyn: Arc<dyn CryptoProvider> = sw.clone();
        let hash = HashHandle::from_raw(provider_dyn, native);
        assert!(hash.parent().is_none());
        hash.release().unwrap();
        assert_eq!(sw.live_hashes(), 0);
        assert_eq!(sw.ref_count(raw), 1);
    }

    #[test]
    fn failed_parent_acquire_records_nothing() {
        let (sw, provider) = open();
        let raw = provider.raw().unwrap();
        let native = sw.create_hash(raw).unwrap();
        let provider_dyn: Arc<dyn CryptoProvider> = sw.clone();
        let hash = HashHandle::from_raw(provider_dyn, native);
        sw.inject_fault(Fault::AddRef);
        assert!(hash.set_parent(&provider).is_err());
        assert!(hash.parent().is_none());
        hash.set_parent(&provider).unwrap();
        assert_eq!(sw.ref_count(raw), 2);
    }

    #[test]
    fn set_parent_on_released_provider_fails() {
        let (sw, provider) = open();
        let raw = provider.raw().unwrap();
        let native = sw.create_hash(raw).unwrap();
        let provider_dyn: Arc<dyn CryptoProvider> = sw.clone();
        let hash = HashHandle::from_raw(provider_dyn, native);
        let keep = provider.duplicate().unwrap();
        provider.release().unwrap();
        assert!(hash.set_parent(&provider).unwrap_err().is_invalid_state());
        drop(hash);
        drop(keep);
        assert_eq!(sw.live_providers(), 0);
    }

    #[test]
    fn invalid_sentinel_is_shared_and_inert() {
        let a = HashHandle::invalid();
        let b = HashHandle::invalid();
        assert!(core::ptr::eq(a, b));
        assert!(a.is_invalid());
        assert!(a.release().is_ok());
        assert!(!a.is_released());
        assert!(a.raw().unwrap_err().is_invalid_state());
        assert!(KeyHandle::invalid().is_invalid());
    }

    #[test]
    fn invalid_sentinel_survives_racing_initializers() {
        const THREADS: usize = 8;
        let cell: OnceBox<KeyHandle> = OnceBox::new();
        let built = AtomicUsize::new(0);
        let barrier = Barrier::new(THREADS);

        let ptrs: Vec<usize> = std::thread::scope(|s| {
            let hs: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        let h = cell.get_or_init(|| {
                            built.fetch_add(1, Ordering::SeqCst);
                            Box::new(KeyHandle::sentinel())
                        });
                        h as *const KeyHandle as usize
                    })
                })
                .collect();
            hs.into_iter().map(|h| h.join().unwrap()).collect()
        });

        // Every racer sees the one published value; losers' builds are dropped.
        assert!(ptrs.windows(2).all(|w| w[0] == w[1]));
        let n = built.load(Ordering::SeqCst);
        assert!((1..=THREADS).contains(&n));
        let published = cell.get().unwrap();
        assert_eq!(published as *const KeyHandle as usize, ptrs[0]);
        assert!(published.is_invalid());
    }

    #[test]
    fn key_duplicate_takes_its_own_parent_reference() {
        let (sw, provider) = open();
        let raw = provider.raw().unwrap();
        let key = KeyHandle::import(&provider, b"0123456789abcdef").unwrap();
        let dup = key.duplicate().unwrap();
        assert_eq!(sw.ref_count(raw), 3);
        assert!(sw.same_key_material(key.raw().unwrap(), dup.raw().unwrap()));
        assert_eq!(dup.key_length().unwrap(), 16);

        key.release().unwrap();
        assert_eq!(dup.key_length().unwrap(), 16);
        drop(dup);
        assert_eq!(sw.ref_count(raw), 1);
        assert_eq!(sw.live_keys(), 0);
    }

    #[test]
    fn key_duplicate_rolls_back_when_parent_ref_fails() {
        let (sw, provider) = open();
        let raw = provider.raw().unwrap();
        let key = KeyHandle::import(&provider, b"k").unwrap();
        sw.inject_fault(Fault::AddRef);
        assert!(key.duplicate().is_err());
        assert_eq!(sw.live_keys(), 1);
        assert_eq!(sw.ref_count(raw), 2);
    }

    #[cfg(debug_assertions)]
    #[test]
    fn set_parent_twice_panics_in_debug() {
        let (_sw, provider) = open();
        let hash = HashHandle::create(&provider).unwrap();
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = hash.set_parent(&provider);
        }));
        assert!(res.is_err());
    }

    #[cfg(not(debug_assertions))]
    #[test]
    fn set_parent_twice_is_rejected_in_release() {
        let (sw, provider) = open();
        let raw = provider.raw().unwrap();
        let hash = HashHandle::create(&provider).unwrap();
        assert_eq!(
            hash.set_parent(&provider),
            Err(Error::InvariantViolation("parent already set"))
        );
        assert_eq!(sw.ref_count(raw), 2);
    }
}
