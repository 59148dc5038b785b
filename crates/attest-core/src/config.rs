use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{AttestError, AttestResult};

/// Top-level configuration (loaded from attest.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AttestConfig {
    pub daemon: DaemonConfig,
    pub hasher: HasherConfig,
    pub scheduler: SchedulerConfig,
    pub sampler: SamplerConfig,
    pub verify: VerifyConfig,
}

impl AttestConfig {
    /// Parse a TOML document. Missing sections and keys take their defaults.
    pub fn from_toml_str(s: &str) -> AttestResult<Self> {
        toml::from_str(s).map_err(|e| AttestError::Config(e.to_string()))
    }

    /// Load from `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> AttestResult<Self> {
        if !path.exists() {
            tracing::warn!(
                "config file not found: {}  (using defaults)",
                path.display()
            );
            return Ok(AttestConfig::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
            .map_err(|e| AttestError::Config(format!("parsing {}: {e}", path.display())))
    }

    pub fn to_toml_string(&self) -> AttestResult<String> {
        toml::to_string_pretty(self).map_err(|e| AttestError::Config(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

/// Hasher engine tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HasherConfig {
    /// Maximum bytes handed to a single `step` call
    pub step_bytes: usize,
    /// Number of versions hashed per resource, newest first (0 = all)
    pub max_versions: usize,
    /// Digest algorithms run in parallel lanes
    pub algorithms: Vec<String>,
}

/// Scheduler tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Byte budget per `step` call
    pub step_bytes: usize,
    /// `step` calls per scheduling quantum
    pub steps_per_quantum: usize,
    /// Constant added to every duration estimate, in milliseconds
    pub pad_constant_ms: u64,
    /// Percentage added to every duration estimate
    pub pad_percent: u64,
    /// Number of finished jobs kept for introspection
    pub completed_max: usize,
    /// Longest the idle worker sleeps before rechecking the queue
    pub idle_wait_ms: u64,
    /// Hash speed assumed until a job has been measured
    pub default_bytes_per_ms: u64,
}

/// Poll sampling tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Algorithm used for the inclusion hash
    pub algorithm: String,
    /// Modulus used when a poll does not supply one (1 = include everything)
    pub default_modulus: i64,
    /// Glob patterns naming substantive resources (empty = all resources)
    pub substance_patterns: Vec<String>,
}

/// Local verification tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    /// Algorithm used for fresh digests
    pub algorithm: String,
    /// Number of versions checked per resource, newest first (0 = all)
    pub max_versions: usize,
    /// Rewrite a stored digest recorded under an obsolete algorithm once the content checks out
    pub rebaseline_obsolete: bool,
    /// Record a digest for versions that had none
    pub record_new_digests: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

impl Default for HasherConfig {
    fn default() -> Self {
        Self {
            step_bytes: 4096,
            max_versions: 1,
            algorithms: vec!["SHA-1".into()],
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            step_bytes: 4096,
            steps_per_quantum: 10,
            pad_constant_ms: 10,
            pad_percent: 10,
            completed_max: 50,
            idle_wait_ms: 1000,
            default_bytes_per_ms: 250,
        }
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            algorithm: "SHA-1".into(),
            default_modulus: 1,
            substance_patterns: Vec::new(),
        }
    }
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            algorithm: "SHA-256".into(),
            max_versions: 0,
            rebaseline_obsolete: true,
            record_new_digests: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[daemon]
log_level = "debug"
log_format = "json"

[hasher]
step_bytes = 1024
max_versions = 3
algorithms = ["SHA-1", "MD5"]

[scheduler]
step_bytes = 8192
steps_per_quantum = 4
pad_constant_ms = 50
pad_percent = 25
completed_max = 10
idle_wait_ms = 200
default_bytes_per_ms = 1000

[sampler]
algorithm = "SHA-256"
default_modulus = 7
substance_patterns = ["*.pdf", "http://*/article/*"]

[verify]
algorithm = "SHA-1"
max_versions = 2
rebaseline_obsolete = false
record_new_digests = false
"#;
        let config = AttestConfig::from_toml_str(toml_str).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.daemon.log_format, "json");
        assert_eq!(config.hasher.step_bytes, 1024);
        assert_eq!(config.hasher.max_versions, 3);
        assert_eq!(config.hasher.algorithms, vec!["SHA-1", "MD5"]);
        assert_eq!(config.scheduler.steps_per_quantum, 4);
        assert_eq!(config.scheduler.pad_percent, 25);
        assert_eq!(config.scheduler.completed_max, 10);
        assert_eq!(config.sampler.default_modulus, 7);
        assert_eq!(config.sampler.substance_patterns.len(), 2);
        assert_eq!(config.verify.algorithm, "SHA-1");
        assert!(!config.verify.rebaseline_obsolete);
    }

    #[test]
    fn test_parse_defaults() {
        let config = AttestConfig::from_toml_str("").unwrap();

        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.hasher.step_bytes, 4096);
        assert_eq!(config.hasher.max_versions, 1);
        assert_eq!(config.hasher.algorithms, vec!["SHA-1"]);
        assert_eq!(config.scheduler.steps_per_quantum, 10);
        assert_eq!(config.scheduler.completed_max, 50);
        assert_eq!(config.sampler.default_modulus, 1);
        assert!(config.sampler.substance_patterns.is_empty());
        assert_eq!(config.verify.algorithm, "SHA-256");
        assert!(config.verify.rebaseline_obsolete);
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[scheduler]
pad_percent = 50
"#;
        let config = AttestConfig::from_toml_str(toml_str).unwrap();

        // Overridden
        assert_eq!(config.scheduler.pad_percent, 50);
        // Defaults
        assert_eq!(config.scheduler.pad_constant_ms, 10);
        assert_eq!(config.scheduler.step_bytes, 4096);
        assert_eq!(config.hasher.algorithms, vec!["SHA-1"]);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = AttestConfig::from_toml_str("[scheduler\nstep_bytes = ").unwrap_err();
        assert!(matches!(err, AttestError::Config(_)));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = AttestConfig::load(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config.hasher.step_bytes, 4096);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = AttestConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        let parsed = AttestConfig::from_toml_str(&toml_str).unwrap();

        assert_eq!(config.hasher.algorithms, parsed.hasher.algorithms);
        assert_eq!(config.scheduler.idle_wait_ms, parsed.scheduler.idle_wait_ms);
        assert_eq!(config.verify.algorithm, parsed.verify.algorithm);
    }
}
