//! HashAlgorithmFacade: the familiar initialize/update/finalize surface of a
//! hash algorithm object, layered over [`HashSession`].

use std::sync::Arc;

use crate::config::{HashAlgorithm, ProviderConfig};
use crate::error::{Error, Result};
use crate::native::CryptoProvider;
use crate::session::{HashSession, SessionState};

/// A hash algorithm object for one fixed algorithm.
#[derive(Debug)]
pub struct HashAlgorithmFacade {
    algorithm: HashAlgorithm,
    session: HashSession,
}

impl HashAlgorithmFacade {
    pub fn new(provider: Arc<dyn CryptoProvider>, algorithm: HashAlgorithm) -> Result<Self> {
        Self::with_config(provider, algorithm, ProviderConfig::for_hash(algorithm))
    }

    /// Like `new`, but with an explicit provider configuration, for example
    /// to pin an implementation. The configured algorithm name must agree
    /// with `algorithm`.
    pub fn with_config(
        provider: Arc<dyn CryptoProvider>,
        algorithm: HashAlgorithm,
        config: ProviderConfig,
    ) -> Result<Self> {
        if config.algorithm.parse::<HashAlgorithm>().ok() != Some(algorithm) {
            return Err(Error::InvariantViolation(
                "provider config names a different algorithm",
            ));
        }
        let session = HashSession::open(provider, config)?;
        Ok(Self { algorithm, session })
    }

    pub fn sha256(provider: Arc<dyn CryptoProvider>) -> Result<Self> {
        Self::new(provider, HashAlgorithm::Sha256)
    }

    pub fn sha384(provider: Arc<dyn CryptoProvider>) -> Result<Self> {
        Self::new(provider, HashAlgorithm::Sha384)
    }

    pub fn sha512(provider: Arc<dyn CryptoProvider>) -> Result<Self> {
        Self::new(provider, HashAlgorithm::Sha512)
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Digest size in bytes.
    pub fn digest_size(&self) -> usize {
        self.algorithm.digest_size()
    }

    pub fn hash_size_bits(&self) -> usize {
        self.algorithm.digest_size() * 8
    }

    /// Start over with a fresh native context.
    pub fn initialize(&mut self) -> Result<()> {
        self.session.reset()
    }

    pub fn update(&mut self, data: &[u8], offset: usize, length: usize) -> Result<()> {
        self.session.update(data, offset, length)
    }

    /// Hash `input[offset..offset + count]` and report how many bytes were
    /// consumed.
    pub fn transform_block(&mut self, input: &[u8], offset: usize, count: usize) -> Result<usize> {
        self.session.update(input, offset, count)?;
        Ok(count)
    }

    /// Finish the digest and check its length against the algorithm.
    pub fn finalize(&mut self) -> Result<Vec<u8>> {
        let digest = self.session.finalize()?;
        if digest.len() != self.digest_size() {
            return Err(Error::DigestLength {
                expected: self.digest_size(),
                actual: digest.len(),
            });
        }
        Ok(digest)
    }

    /// Digest `data` in one call, discarding any partial input.
    pub fn compute_hash(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if self.session.state() != SessionState::Initialized {
            self.session.reset()?;
        }
        self.session.update_all(data)?;
        self.finalize()
    }

    pub fn dispose(&mut self) -> Result<()> {
        self.session.dispose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::software::SoftwareProvider;

    #[test]
    fn sizes_follow_algorithm() {
        let sw = Arc::new(SoftwareProvider::new());
        let f = HashAlgorithmFacade::sha384(sw).unwrap();
        assert_eq!(f.digest_size(), 48);
        assert_eq!(f.hash_size_bits(), 384);
        assert_eq!(f.algorithm(), HashAlgorithm::Sha384);
    }

    #[test]
    fn mismatched_config_is_rejected() {
        let sw = Arc::new(SoftwareProvider::new());
        let res = HashAlgorithmFacade::with_config(
            sw.clone(),
            HashAlgorithm::Sha256,
            ProviderConfig::new("SHA512"),
        );
        assert!(matches!(res, Err(Error::InvariantViolation(_))));
        assert_eq!(sw.live_providers(), 0);
    }

    #[test]
    fn transform_block_reports_consumed_bytes() {
        let sw = Arc::new(SoftwareProvider::new());
        let mut f = HashAlgorithmFacade::sha256(sw).unwrap();
        assert_eq!(f.transform_block(b"xxabcxx", 2, 3).unwrap(), 3);
        assert_eq!(f.state(), SessionState::Accumulating);
    }
}
