//! Linear tokens for provider references and the counting trait that mints
//! them.
//!
//! A token is a zero-sized proof that one reference was acquired from a
//! particular counter. Dropping a token panics; the only valid way to
//! dispose of it is to return it to the originating counter via
//! `Count::put`. Every owner of a provider reference (a `ProviderHandle`, or
//! the parent back-reference inside a child handle) stores exactly one
//! token, so "one increment, exactly one decrement" is visible in the types.

use core::fmt;
use core::marker::PhantomData;
use std::sync::Arc;

use tracing::trace;

use crate::error::{Error, Result};
use crate::native::{CryptoProvider, RawProvider, Status};

/// Zero-sized, linear token tied to its originating counter type.
pub struct Token<'a, C: ?Sized> {
    _lt: PhantomData<&'a ()>,
    // fn-pointer marker keeps the token Send + Sync regardless of `C`.
    _ctr: PhantomData<fn() -> *const C>,
}

impl<'a, C: ?Sized> Token<'a, C> {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            _lt: PhantomData,
            _ctr: PhantomData,
        }
    }
}

impl<'a, C: ?Sized> Drop for Token<'a, C> {
    fn drop(&mut self) {
        // A second panic while unwinding would abort; the leaked reference is
        // the lesser evil there.
        if !std::thread::panicking() {
            panic!("Token dropped without Count::put");
        }
    }
}

impl<'a, C: ?Sized> fmt::Debug for Token<'a, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token")
    }
}

/// A source of counted references, enforced by linear token flow.
pub trait Count {
    /// The token type minted by this counter.
    type Token<'a>: Sized
    where
        Self: 'a;

    /// Acquire one counted reference and return a linear token for it.
    ///
    /// Unlike an in-memory counter the increment can fail; no token exists
    /// in that case and the count is unchanged.
    fn get(&self) -> Result<Self::Token<'static>>;

    /// Return (consume) a previously acquired token.
    /// Returns true if the underlying decrement succeeded.
    fn put<'a>(&'a self, t: Self::Token<'a>) -> bool;
}

/// The external reference count of one open provider id.
///
/// Cloning a `NativeCount` does not touch the count; it only copies the
/// means to reach it.
#[derive(Clone)]
pub struct NativeCount {
    provider: Arc<dyn CryptoProvider>,
    raw: RawProvider,
    algorithm: Arc<str>,
}

impl NativeCount {
    pub(crate) fn new(provider: Arc<dyn CryptoProvider>, raw: RawProvider, algorithm: &str) -> Self {
        Self {
            provider,
            raw,
            algorithm: Arc::from(algorithm),
        }
    }

    /// Take ownership of the reference handed out by `CryptoProvider::open`.
    pub(crate) fn adopt(&self) -> Token<'static, Self> {
        Token::new()
    }

    pub fn raw(&self) -> RawProvider {
        self.raw
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn provider(&self) -> &Arc<dyn CryptoProvider> {
        &self.provider
    }
}

impl fmt::Debug for NativeCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeCount")
            .field("raw", &self.raw)
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

impl Count for NativeCount {
    type Token<'a>
        = Token<'a, Self>
    where
        Self: 'a;

    #[inline]
    fn get(&self) -> Result<Self::Token<'static>> {
        if self.provider.add_ref(self.raw) {
            trace!(provider = self.raw.0, "add_ref");
            Ok(Token::<'static, Self>::new())
        } else {
            Err(Error::ProviderUnavailable {
                algorithm: self.algorithm.to_string(),
                status: Status::UNSUCCESSFUL,
            })
        }
    }

    #[inline]
    fn put<'a>(&'a self, t: Self::Token<'a>) -> bool {
        let ok = self.provider.release(self.raw);
        trace!(provider = self.raw.0, ok, "release");
        core::mem::forget(t);
        ok
    }
}
