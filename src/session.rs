//! HashSession: an incremental hash state machine over a provider.
//!
//! ```text
//! Uninitialized --initialize--> Initialized --update--> Accumulating
//!                                    |                      |
//!                                    +------finalize--------+--> Finalized
//! Finalized --reset--> Initialized          any --dispose--> Disposed
//! ```
//!
//! A session owns one provider reference and one hash child. The child holds
//! its own reference to the provider, and on dispose it is always released
//! first.

use core::fmt;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::child::HashHandle;
use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::native::{CryptoProvider, RawHash, RawProvider};
use crate::provider_handle::ProviderHandle;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    Uninitialized,
    Initialized,
    Accumulating,
    Finalized,
    Disposed,
}

impl SessionState {
    pub fn name(self) -> &'static str {
        match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Initialized => "initialized",
            SessionState::Accumulating => "accumulating",
            SessionState::Finalized => "finalized",
            SessionState::Disposed => "disposed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The parts of a session's hash child that are safe to observe.
///
/// Release and re-parenting stay with the session.
#[derive(Copy, Clone, Debug)]
pub struct HashContextView<'a> {
    hash: &'a HashHandle,
}

impl HashContextView<'_> {
    /// True when the session holds no hash child.
    pub fn is_invalid(&self) -> bool {
        self.hash.is_invalid()
    }

    pub fn raw(&self) -> Result<RawHash> {
        self.hash.raw()
    }

    /// The provider the hash child holds a reference to.
    pub fn parent(&self) -> Option<RawProvider> {
        self.hash.parent()
    }
}

/// An incremental hash computation.
///
/// Mutating operations take `&mut self`, so a session has a single logical
/// owner. Independent sessions may share a provider across threads.
pub struct HashSession {
    provider: Arc<dyn CryptoProvider>,
    config: ProviderConfig,
    parent: Option<ProviderHandle>,
    hash: Option<HashHandle>,
    state: SessionState,
    bytes_hashed: u64,
}

impl HashSession {
    /// A session that holds no native resources yet.
    pub fn new(provider: Arc<dyn CryptoProvider>) -> Self {
        Self {
            provider,
            config: ProviderConfig::default(),
            parent: None,
            hash: None,
            state: SessionState::Uninitialized,
            bytes_hashed: 0,
        }
    }

    /// Create and initialize a session in one step.
    pub fn open(provider: Arc<dyn CryptoProvider>, config: ProviderConfig) -> Result<Self> {
        let mut session = Self::new(provider);
        session.initialize(config)?;
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn algorithm(&self) -> &str {
        &self.config.algorithm
    }

    /// Bytes appended since the last (re)initialization.
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes_hashed
    }

    /// Read-only view of the current hash child, backed by the shared
    /// invalid sentinel when the session holds none.
    pub fn hash_context(&self) -> HashContextView<'_> {
        HashContextView {
            hash: match &self.hash {
                Some(hash) => hash,
                None => HashHandle::invalid(),
            },
        }
    }

    /// Open a provider for `config` and create a fresh hash context.
    ///
    /// Any resources held from an earlier initialization are released first.
    /// On failure the session is left `Uninitialized` and may be retried.
    #[tracing::instrument(skip_all, fields(algorithm = %config.algorithm))]
    pub fn initialize(&mut self, config: ProviderConfig) -> Result<SessionState> {
        self.ensure_not_disposed("initialize")?;
        self.release_resources("initialize");
        self.config = config;
        self.state = SessionState::Uninitialized;
        self.bytes_hashed = 0;

        let parent = ProviderHandle::open(self.provider.clone(), &self.config)
            .map_err(Error::initialization)?;
        let hash = HashHandle::create(&parent).map_err(Error::initialization)?;
        self.parent = Some(parent);
        self.hash = Some(hash);
        self.state = SessionState::Initialized;
        debug!("session initialized");
        Ok(self.state)
    }

    /// Append `data[offset..offset + length]` to the digest.
    ///
    /// The state is checked first, then the range: `offset + length` must
    /// not exceed `data.len()` even when `length` is zero. A zero `length`
    /// that passes both checks is a no-op with no native call and no state
    /// change.
    pub fn update(&mut self, data: &[u8], offset: usize, length: usize) -> Result<()> {
        let hash = match self.state {
            SessionState::Initialized | SessionState::Accumulating => self.live_hash()?,
            _ => return Err(self.invalid_state("update")),
        };
        let end = offset
            .checked_add(length)
            .filter(|&end| end <= data.len())
            .ok_or(Error::OutOfRange {
                offset,
                length,
                len: data.len(),
            })?;
        if length == 0 {
            return Ok(());
        }
        hash.update(&data[offset..end])?;
        self.state = SessionState::Accumulating;
        self.bytes_hashed += length as u64;
        Ok(())
    }

    /// Append all of `data`.
    pub fn update_all(&mut self, data: &[u8]) -> Result<()> {
        self.update(data, 0, data.len())
    }

    /// Produce the digest of everything appended since initialization.
    #[tracing::instrument(skip_all, fields(algorithm = %self.config.algorithm))]
    pub fn finalize(&mut self) -> Result<Vec<u8>> {
        let hash = match self.state {
            SessionState::Initialized | SessionState::Accumulating => self.live_hash()?,
            _ => return Err(self.invalid_state("finalize")),
        };
        let digest = hash.finish()?;
        self.state = SessionState::Finalized;
        debug!(bytes = self.bytes_hashed, len = digest.len(), "session finalized");
        Ok(digest)
    }

    /// Replace the hash context with a fresh one and return to
    /// `Initialized`.
    ///
    /// The old context is released before the new one is acquired; a
    /// failed release is logged rather than returned. If the new context
    /// cannot be acquired the session is left `Uninitialized`.
    #[tracing::instrument(skip_all, fields(algorithm = %self.config.algorithm))]
    pub fn reset(&mut self) -> Result<()> {
        self.ensure_not_disposed("reset")?;
        if let Some(hash) = self.hash.take() {
            if let Err(e) = hash.release() {
                warn!(?e, "releasing previous hash context failed");
            }
        }
        self.state = SessionState::Uninitialized;
        self.bytes_hashed = 0;

        let live_parent = self.parent.as_ref().filter(|p| !p.is_released());
        let hash = match live_parent {
            Some(parent) => HashHandle::create(parent).map_err(Error::initialization)?,
            None => {
                let parent = ProviderHandle::open(self.provider.clone(), &self.config)
                    .map_err(Error::initialization)?;
                let hash = HashHandle::create(&parent).map_err(Error::initialization)?;
                if let Some(old) = self.parent.replace(parent) {
                    if let Err(e) = old.release() {
                        warn!(?e, "releasing previous provider failed");
                    }
                }
                hash
            }
        };
        self.hash = Some(hash);
        self.state = SessionState::Initialized;
        debug!("session reset");
        Ok(())
    }

    /// Release the hash context, then the provider. Terminal and idempotent.
    ///
    /// Both releases are attempted; the first failure is returned.
    #[tracing::instrument(skip_all, fields(algorithm = %self.config.algorithm))]
    pub fn dispose(&mut self) -> Result<()> {
        if self.state == SessionState::Disposed {
            return Ok(());
        }
        self.state = SessionState::Disposed;
        let hash_result = self.hash.take().map_or(Ok(()), |hash| hash.release());
        let parent_result = self.parent.take().map_or(Ok(()), |parent| parent.release());
        debug!(
            hash_ok = hash_result.is_ok(),
            provider_ok = parent_result.is_ok(),
            "session disposed"
        );
        hash_result.and(parent_result)
    }

    /// Release whatever is held without reporting failures.
    fn release_resources(&mut self, op: &'static str) {
        if let Some(hash) = self.hash.take() {
            if let Err(e) = hash.release() {
                warn!(?e, op, "releasing hash context failed");
            }
        }
        if let Some(parent) = self.parent.take() {
            if let Err(e) = parent.release() {
                warn!(?e, op, "releasing provider failed");
            }
        }
    }

    // Initialized and Accumulating always carry a hash context.
    fn live_hash(&self) -> Result<&HashHandle> {
        self.hash
            .as_ref()
            .ok_or(Error::InvariantViolation("session state requires a hash context"))
    }

    fn invalid_state(&self, op: &'static str) -> Error {
        Error::InvalidState {
            op,
            state: self.state.name(),
        }
    }

    fn ensure_not_disposed(&self, op: &'static str) -> Result<()> {
        if self.state == SessionState::Disposed {
            return Err(self.invalid_state(op));
        }
        Ok(())
    }
}

impl fmt::Debug for HashSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashSession")
            .field("algorithm", &self.config.algorithm)
            .field("state", &self.state)
            .field("bytes_hashed", &self.bytes_hashed)
            .field("hash", &self.hash)
            .finish()
    }
}

impl Drop for HashSession {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            error!(?e, "session dispose failed on drop");
        }
    }
}
