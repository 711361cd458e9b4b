//! Provider configuration and the hash algorithms the crate knows about.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hash algorithms with a published digest size.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashAlgorithm {
    #[serde(rename = "SHA256")]
    Sha256,
    #[serde(rename = "SHA384")]
    Sha384,
    #[serde(rename = "SHA512")]
    Sha512,
}

impl HashAlgorithm {
    /// Canonical provider name.
    pub fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "SHA256",
            HashAlgorithm::Sha384 => "SHA384",
            HashAlgorithm::Sha512 => "SHA512",
        }
    }

    /// Digest size in bytes.
    pub fn digest_size(self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    /// Block size in bytes.
    pub fn block_size(self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 64,
            HashAlgorithm::Sha384 | HashAlgorithm::Sha512 => 128,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Returned when an algorithm name is not recognised.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("unknown hash algorithm: {0}")]
pub struct UnknownAlgorithm(pub String);

impl FromStr for HashAlgorithm {
    type Err = UnknownAlgorithm;

    /// Accepts `SHA512`, `sha-512` and similar spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .map(|c| c.to_ascii_uppercase())
            .collect();
        match norm.as_str() {
            "SHA256" => Ok(HashAlgorithm::Sha256),
            "SHA384" => Ok(HashAlgorithm::Sha384),
            "SHA512" => Ok(HashAlgorithm::Sha512),
            _ => Err(UnknownAlgorithm(s.to_owned())),
        }
    }
}

/// Which provider to open and for what algorithm.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderConfig {
    /// Algorithm name passed to the provider's `open`.
    pub algorithm: String,
    /// Optional implementation name; `None` lets the provider choose.
    pub implementation: Option<String>,
}

impl ProviderConfig {
    pub fn new(algorithm: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            implementation: None,
        }
    }

    pub fn for_hash(algorithm: HashAlgorithm) -> Self {
        Self::new(algorithm.name())
    }

    pub fn with_implementation(mut self, implementation: impl Into<String>) -> Self {
        self.implementation = Some(implementation.into());
        self
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self::for_hash(HashAlgorithm::Sha512)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_spellings() {
        assert_eq!("SHA512".parse::<HashAlgorithm>(), Ok(HashAlgorithm::Sha512));
        assert_eq!("sha-384".parse::<HashAlgorithm>(), Ok(HashAlgorithm::Sha384));
        assert_eq!("Sha_256".parse::<HashAlgorithm>(), Ok(HashAlgorithm::Sha256));
        assert!("MD5".parse::<HashAlgorithm>().is_err());
    }

    #[test]
    fn unknown_algorithm_reports_the_input() {
        let err = "md-5".parse::<HashAlgorithm>().unwrap_err();
        assert_eq!(err, UnknownAlgorithm("md-5".to_owned()));
        assert_eq!(err.to_string(), "unknown hash algorithm: md-5");
        let boxed: Box<dyn std::error::Error> = Box::new(err);
        assert!(boxed.source().is_none());
    }

    #[test]
    fn sizes_match_published_values() {
        assert_eq!(HashAlgorithm::Sha256.digest_size(), 32);
        assert_eq!(HashAlgorithm::Sha384.digest_size(), 48);
        assert_eq!(HashAlgorithm::Sha512.digest_size(), 64);
        assert_eq!(HashAlgorithm::Sha512.block_size(), 128);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let cfg: ProviderConfig = serde_json::from_str(r#"{"implementation":"software"}"#).unwrap();
        assert_eq!(cfg.algorithm, "SHA512");
        assert_eq!(cfg.implementation.as_deref(), Some("software"));

        let cfg: ProviderConfig = serde_json::from_str(r#"{"algorithm":"SHA256"}"#).unwrap();
        assert_eq!(cfg, ProviderConfig::for_hash(HashAlgorithm::Sha256));
    }

    #[test]
    fn config_rejects_unknown_fields() {
        let res = serde_json::from_str::<ProviderConfig>(r#"{"algo":"SHA256"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn algorithm_serializes_by_provider_name() {
        let s = serde_json::to_string(&HashAlgorithm::Sha384).unwrap();
        assert_eq!(s, "\"SHA384\"");
    }
}
