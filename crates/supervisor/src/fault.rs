//! Text-signature fault classification
//!
//! Infrastructure flakiness (collective-library errors, connection resets,
//! timeouts, allocator exhaustion) tends to resolve on its own; anything
//! unrecognised is treated as fatal.

use std::fmt;

use runtime_core::config::DEFAULT_TRANSIENT_SIGNATURES;
use runtime_core::FaultConfig;

/// Retry decision for one observed failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    Retriable,
    NonRetriable,
}

impl FaultClass {
    pub fn is_retriable(self) -> bool {
        self == FaultClass::Retriable
    }
}

/// Case-insensitive substring matcher over a failure's rendered text
#[derive(Debug, Clone)]
pub struct FaultClassifier {
    signatures: Vec<String>,
}

impl FaultClassifier {
    pub fn new<I, S>(signatures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            signatures: signatures
                .into_iter()
                .map(|s| s.as_ref().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    /// Add one more transient signature
    pub fn with_signature(mut self, signature: impl AsRef<str>) -> Self {
        let signature = signature.as_ref().to_lowercase();
        if !signature.is_empty() {
            self.signatures.push(signature);
        }
        self
    }

    pub fn signatures(&self) -> &[String] {
        &self.signatures
    }

    /// Classify any failure with a text form
    pub fn classify<E: fmt::Display + ?Sized>(&self, failure: &E) -> FaultClass {
        self.classify_text(&failure.to_string())
    }

    pub fn classify_text(&self, text: &str) -> FaultClass {
        let text = text.to_lowercase();
        if self.signatures.iter().any(|sig| text.contains(sig.as_str())) {
            FaultClass::Retriable
        } else {
            FaultClass::NonRetriable
        }
    }
}

impl Default for FaultClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_TRANSIENT_SIGNATURES)
    }
}

impl From<&FaultConfig> for FaultClassifier {
    fn from(config: &FaultConfig) -> Self {
        Self::new(&config.transient_signatures)
    }
}
