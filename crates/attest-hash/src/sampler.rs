//! Deterministic poll sampling and the substance check.
//!
//! Membership is a pure function of `(nonce, resource id, modulus)`: the
//! nonce and id are digested together and the final digest byte, read as a
//! signed value shifted into `0..=255`, must be divisible by the modulus.

use attest_core::config::SamplerConfig;
use attest_core::ResourceId;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::algorithm::Algorithm;
use crate::error::{HashError, HashResult};
use crate::hasher::ResourceSelector;

/// One-shot form of [`Sampler::included`].
pub fn included_in_sample(
    algorithm: Algorithm,
    nonce: &[u8],
    resource: &ResourceId,
    modulus: i64,
) -> HashResult<bool> {
    Ok(Sampler::new(algorithm, nonce, modulus)?.included(resource))
}

/// Map the last digest byte from a signed byte to `0..=255`.
fn sample_value(last: u8) -> u64 {
    (i16::from(last as i8) + 128) as u64
}

#[derive(Debug, Clone)]
pub struct Sampler {
    algorithm: Algorithm,
    nonce: Vec<u8>,
    modulus: u64,
}

impl Sampler {
    /// Fails with `InvalidModulus` unless `modulus > 0`.
    pub fn new(algorithm: Algorithm, nonce: &[u8], modulus: i64) -> HashResult<Self> {
        if modulus <= 0 {
            return Err(HashError::InvalidModulus(modulus));
        }
        Ok(Sampler {
            algorithm,
            nonce: nonce.to_vec(),
            modulus: modulus as u64,
        })
    }

    /// Build from config; `modulus` overrides `default_modulus` when the poll supplies one.
    pub fn from_config(config: &SamplerConfig, nonce: &[u8], modulus: Option<i64>) -> HashResult<Self> {
        let algorithm = config.algorithm.parse()?;
        Self::new(algorithm, nonce, modulus.unwrap_or(config.default_modulus))
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn nonce(&self) -> &[u8] {
        &self.nonce
    }

    pub fn modulus(&self) -> u64 {
        self.modulus
    }

    pub fn included(&self, resource: &ResourceId) -> bool {
        if self.modulus == 1 {
            return true;
        }
        let mut lane = self.algorithm.lane();
        lane.update(&self.nonce);
        lane.update(resource.as_bytes());
        let digest = lane.finalize_boxed();
        match digest.last() {
            Some(&last) => sample_value(last) % self.modulus == 0,
            None => false,
        }
    }
}

/// Decides whether a resource is primary content rather than boilerplate.
pub trait SubstanceChecker: Send + Sync {
    fn is_substance(&self, resource: &ResourceId) -> bool;
}

/// Treats every resource as substance.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllSubstance;

impl SubstanceChecker for AllSubstance {
    fn is_substance(&self, _resource: &ResourceId) -> bool {
        true
    }
}

/// Substance is any resource whose id matches one of a set of glob patterns.
#[derive(Debug, Clone)]
pub struct PatternSubstance {
    patterns: Vec<glob::Pattern>,
}

impl PatternSubstance {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> HashResult<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                glob::Pattern::new(p.as_ref()).map_err(|e| HashError::InvalidPattern {
                    pattern: p.as_ref().to_string(),
                    reason: e.msg.to_string(),
                })
            })
            .collect::<HashResult<Vec<_>>>()?;
        Ok(PatternSubstance { patterns })
    }

    /// `AllSubstance` when no patterns are configured.
    pub fn from_config(config: &SamplerConfig) -> HashResult<Arc<dyn SubstanceChecker>> {
        if config.substance_patterns.is_empty() {
            return Ok(Arc::new(AllSubstance));
        }
        Ok(Arc::new(Self::new(config.substance_patterns.as_slice())?))
    }
}

impl SubstanceChecker for PatternSubstance {
    fn is_substance(&self, resource: &ResourceId) -> bool {
        self.patterns.iter().any(|p| p.matches(resource.as_str()))
    }
}

/// Counters kept by a [`SampleSelector`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SampleStats {
    pub included: u64,
    pub excluded_by_sample: u64,
    pub excluded_by_substance: u64,
}

/// Resource selector admitting resources that are both sampled and substantive.
pub struct SampleSelector {
    sampler: Sampler,
    substance: Arc<dyn SubstanceChecker>,
    included: AtomicU64,
    excluded_by_sample: AtomicU64,
    excluded_by_substance: AtomicU64,
}

impl SampleSelector {
    pub fn new(sampler: Sampler, substance: Arc<dyn SubstanceChecker>) -> Self {
        SampleSelector {
            sampler,
            substance,
            included: AtomicU64::new(0),
            excluded_by_sample: AtomicU64::new(0),
            excluded_by_substance: AtomicU64::new(0),
        }
    }

    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    pub fn stats(&self) -> SampleStats {
        SampleStats {
            included: self.included.load(Ordering::Relaxed),
            excluded_by_sample: self.excluded_by_sample.load(Ordering::Relaxed),
            excluded_by_substance: self.excluded_by_substance.load(Ordering::Relaxed),
        }
    }
}

impl ResourceSelector for SampleSelector {
    fn select(&self, resource: &ResourceId) -> bool {
        if !self.sampler.included(resource) {
            self.excluded_by_sample.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if !self.substance.is_substance(resource) {
            self.excluded_by_substance.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.included.fetch_add(1, Ordering::Relaxed);
        true
    }
}
