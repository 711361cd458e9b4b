//! ProviderHandle: one owned reference to an open provider.

use core::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::native::{CryptoProvider, RawProvider};
use crate::tokens::{Count, NativeCount, Token};

/// An owner of exactly one reference to a native provider.
///
/// Duplicating yields another independent owner of the same native
/// provider. Each owner releases its own reference once, either explicitly
/// through [`ProviderHandle::release`] or on drop. Child handles created
/// from a provider take their own reference, so releasing this owner never
/// invalidates them.
pub struct ProviderHandle {
    count: NativeCount,
    // `None` once released. The lock spans the native call and the state
    // change on every path that touches the count.
    token: Mutex<Option<Token<'static, NativeCount>>>,
}

impl ProviderHandle {
    /// Open the provider named by `config`.
    pub fn open(provider: Arc<dyn CryptoProvider>, config: &ProviderConfig) -> Result<Self> {
        let raw = provider
            .open(&config.algorithm, config.implementation.as_deref())
            .map_err(|status| Error::from_open_status(&config.algorithm, status))?;
        if raw.is_null() {
            return Err(Error::InvariantViolation("provider returned a null handle"));
        }
        let count = NativeCount::new(provider, raw, &config.algorithm);
        let token = count.adopt();
        debug!(provider = raw.0, algorithm = %config.algorithm, "provider opened");
        Ok(Self::from_parts(count, token))
    }

    fn from_parts(count: NativeCount, token: Token<'static, NativeCount>) -> Self {
        Self {
            count,
            token: Mutex::new(Some(token)),
        }
    }

    /// Create a second owner of the same native provider.
    ///
    /// The increment and the construction of the new owner happen under
    /// this handle's lock, so a concurrent `release` of `self` is ordered
    /// entirely before or entirely after. On failure nothing changes.
    pub fn duplicate(&self) -> Result<Self> {
        let guard = self.token.lock();
        if guard.is_none() {
            return Err(Error::InvalidState {
                op: "duplicate",
                state: "released",
            });
        }
        let token = self.count.get()?;
        let dup = Self::from_parts(self.count.clone(), token);
        drop(guard);
        debug!(provider = self.count.raw().0, "provider duplicated");
        Ok(dup)
    }

    /// Release this owner's reference. Idempotent: only the first call
    /// touches the native count. A failed release still leaves the handle
    /// closed.
    pub fn release(&self) -> Result<()> {
        let mut guard = self.token.lock();
        let Some(token) = guard.take() else {
            return Ok(());
        };
        if self.count.put(token) {
            debug!(provider = self.count.raw().0, "provider released");
            Ok(())
        } else {
            Err(Error::ReleaseFailed {
                resource: "provider",
                step: "release",
            })
        }
    }

    pub fn is_released(&self) -> bool {
        self.token.lock().is_none()
    }

    /// The native id, if this owner still holds its reference.
    pub fn raw(&self) -> Result<RawProvider> {
        if self.is_released() {
            return Err(Error::InvalidState {
                op: "raw",
                state: "released",
            });
        }
        Ok(self.count.raw())
    }

    pub fn algorithm(&self) -> &str {
        self.count.algorithm()
    }

    pub fn provider(&self) -> &Arc<dyn CryptoProvider> {
        self.count.provider()
    }

    /// Take a new reference on behalf of a child, under this handle's lock.
    pub(crate) fn acquire_for_child(&self) -> Result<(NativeCount, Token<'static, NativeCount>)> {
        let guard = self.token.lock();
        if guard.is_none() {
            return Err(Error::InvalidState {
                op: "set_parent",
                state: "released",
            });
        }
        let token = self.count.get()?;
        drop(guard);
        Ok((self.count.clone(), token))
    }
}

impl fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("raw", &self.count.raw())
            .field("algorithm", &self.count.algorithm())
            .field("released", &self.is_released())
            .finish()
    }
}

impl Drop for ProviderHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            error!(?e, provider = self.count.raw().0, "provider release failed on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::software::{Fault, SoftwareProvider};

    fn sw() -> (Arc<SoftwareProvider>, Arc<dyn CryptoProvider>) {
        let sw = Arc::new(SoftwareProvider::new());
        let dynp: Arc<dyn CryptoProvider> = sw.clone();
        (sw, dynp)
    }

    #[test]
    fn open_maps_unknown_algorithm_to_unavailable() {
        let (_, p) = sw();
        match ProviderHandle::open(p, &ProviderConfig::new("MD4")) {
            Err(Error::ProviderUnavailable { algorithm, .. }) => assert_eq!(algorithm, "MD4"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn open_maps_no_memory_to_exhausted() {
        let (s, p) = sw();
        s.inject_fault(Fault::Open);
        assert!(matches!(
            ProviderHandle::open(p, &ProviderConfig::default()),
            Err(Error::ResourceExhausted { op: "open", .. })
        ));
    }

    #[test]
    fn failed_duplicate_leaves_original_untouched() {
        let (s, p) = sw();
        let h = ProviderHandle::open(p, &ProviderConfig::default()).unwrap();
        let raw = h.raw().unwrap();
        s.inject_fault(Fault::AddRef);
        assert!(h.duplicate().is_err());
        assert!(!h.is_released());
        assert_eq!(s.ref_count(raw), 1);
        h.release().unwrap();
        assert_eq!(s.ref_count(raw), 0);
    }

    #[test]
    fn failed_release_still_closes() {
        let (s, p) = sw();
        let h = ProviderHandle::open(p, &ProviderConfig::default()).unwrap();
        let raw = h.raw().unwrap();
        s.inject_fault(Fault::Release);
        assert_eq!(
            h.release(),
            Err(Error::ReleaseFailed {
                resource: "provider",
                step: "release"
            })
        );
        assert!(h.is_released());
        assert!(h.release().is_ok());
        assert!(h.duplicate().unwrap_err().is_invalid_state());
        // The native reference leaked with the failed release.
        assert_eq!(s.ref_count(raw), 1);
    }
}
