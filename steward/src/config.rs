//! Agent configuration stored under `<store>/config.toml`.
//!
//! The file is edited by operators and must remain stable and automatable.
//! Missing fields default to sensible values; everything is validated on
//! load so a bad edit fails the run up front instead of mid-pipeline.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use primitive_types::{H160, H256};
use serde::{Deserialize, Serialize};

use crate::core::filter::OriginPolicy;
use crate::io::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StewardConfig {
    /// Decisions below this confidence are skipped, not submitted.
    pub confidence_threshold: f64,

    /// Cap on items decided in a single run.
    pub max_items_per_run: usize,

    /// Origin regex patterns; empty means every origin is allowed.
    pub allowed_origins: Vec<String>,

    /// Origin regex patterns rejected before the decision engine runs.
    pub denied_origins: Vec<String>,

    /// Grace period for the shutdown drain, in seconds.
    pub shutdown_grace_secs: u64,

    pub retry: RetryPolicy,
    pub engine: EngineConfig,
    pub surface: SurfaceConfig,
    pub attestation: AttestationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Command invoked per item (e.g. `["steward-engine"]`). The pending
    /// item arrives as JSON on stdin; the decision must be written to the
    /// output path appended as the final argument.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: vec!["steward-engine".to_string()],
            timeout_secs: 5 * 60,
            output_limit_bytes: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SurfaceConfig {
    /// Command submitting one decision; receives `source_key item_id` as
    /// trailing arguments and the decision as JSON on stdin, prints a
    /// submission receipt as JSON.
    pub submit_command: Vec<String>,
    /// Command answering "did this submission already happen"; prints a
    /// receipt or `null`.
    pub query_command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            submit_command: vec!["steward-submit".to_string()],
            query_command: vec!["steward-query".to_string()],
            timeout_secs: 2 * 60,
            output_limit_bytes: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AttestationConfig {
    /// Numeric chain identifier in the signing domain.
    pub chain_id: u64,
    /// Address of the contract that validates signatures on-chain.
    pub verifying_contract: String,
    /// Schema UID the attestation payload is encoded under.
    pub schema_uid: String,
    /// Signature validity window added to "now" for each fresh deadline.
    pub deadline_secs: u64,
    /// Path (relative to the store) of the hex-encoded signing key.
    pub key_file: String,
    /// Signing-domain name and version of the verifying ledger.
    pub domain_name: String,
    pub domain_version: String,
}

impl Default for AttestationConfig {
    fn default() -> Self {
        Self {
            chain_id: 8453,
            verifying_contract: "0x4200000000000000000000000000000000000021".to_string(),
            schema_uid: String::new(),
            deadline_secs: 3600,
            key_file: "signer.key".to_string(),
            domain_name: "EAS".to_string(),
            domain_version: "1.2.0".to_string(),
        }
    }
}

impl Default for StewardConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            max_items_per_run: 3,
            allowed_origins: Vec::new(),
            denied_origins: Vec::new(),
            shutdown_grace_secs: 30,
            retry: RetryPolicy::default(),
            engine: EngineConfig::default(),
            surface: SurfaceConfig::default(),
            attestation: AttestationConfig::default(),
        }
    }
}

impl StewardConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(anyhow!("confidence_threshold must be within [0.0, 1.0]"));
        }
        if self.max_items_per_run == 0 {
            return Err(anyhow!("max_items_per_run must be > 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be > 0"));
        }
        if self.engine.command.is_empty() || self.engine.command[0].trim().is_empty() {
            return Err(anyhow!("engine.command must be a non-empty array"));
        }
        if self.surface.submit_command.is_empty() {
            return Err(anyhow!("surface.submit_command must be a non-empty array"));
        }
        if self.surface.query_command.is_empty() {
            return Err(anyhow!("surface.query_command must be a non-empty array"));
        }
        if self.engine.timeout_secs == 0 || self.surface.timeout_secs == 0 {
            return Err(anyhow!("collaborator timeouts must be > 0"));
        }
        self.origin_policy()?;
        parse_h160(&self.attestation.verifying_contract)
            .context("attestation.verifying_contract")?;
        if !self.attestation.schema_uid.is_empty() {
            parse_h256(&self.attestation.schema_uid).context("attestation.schema_uid")?;
        }
        Ok(())
    }

    pub fn origin_policy(&self) -> Result<OriginPolicy> {
        OriginPolicy::from_patterns(&self.allowed_origins, &self.denied_origins)
            .context("compile origin patterns")
    }

    pub fn verifying_contract(&self) -> Result<H160> {
        parse_h160(&self.attestation.verifying_contract)
    }

    pub fn schema_uid(&self) -> Result<H256> {
        if self.attestation.schema_uid.is_empty() {
            return Err(anyhow!("attestation.schema_uid is not configured"));
        }
        parse_h256(&self.attestation.schema_uid)
    }
}

fn parse_h160(value: &str) -> Result<H160> {
    let stripped = value.strip_prefix("0x").unwrap_or(value);
    let bytes = hex::decode(stripped).with_context(|| format!("decode address {value:?}"))?;
    if bytes.len() != 20 {
        return Err(anyhow!("address {value:?} must be 20 bytes"));
    }
    Ok(H160::from_slice(&bytes))
}

fn parse_h256(value: &str) -> Result<H256> {
    let stripped = value.strip_prefix("0x").unwrap_or(value);
    let bytes = hex::decode(stripped).with_context(|| format!("decode hash {value:?}"))?;
    if bytes.len() != 32 {
        return Err(anyhow!("hash {value:?} must be 32 bytes"));
    }
    Ok(H256::from_slice(&bytes))
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `StewardConfig::default()`.
pub fn load_config(path: &Path) -> Result<StewardConfig> {
    if !path.exists() {
        let config = StewardConfig::default();
        config.validate()?;
        return Ok(config);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let config: StewardConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, config: &StewardConfig) -> Result<()> {
    config.validate()?;
    let mut buf = toml::to_string_pretty(config).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
