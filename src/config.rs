//! Configuration management
//!
//! Everything comes from `SKILLBOX_*` environment variables (a `.env` file is
//! loaded by the binary first). Unset variables fall back to each
//! subsystem's `Default`; malformed values are errors.

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::governance::GovernancePolicy;
use crate::scanner::ScannerConfig;
use crate::skills::registry::RegistryConfig;
use crate::skills::sandbox::{ResourceLimits, SandboxConfig};

/// Default semantic scanning model
pub const DEFAULT_SCAN_MODEL: &str = "claude-sonnet-4-20250514";

/// Service configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Anthropic API key; without it every semantic scan fails open
    pub anthropic_api_key: Option<String>,

    /// Messages endpoint override (proxy, gateway)
    pub anthropic_api_url: Option<String>,

    /// SQLite registry path
    pub db_path: PathBuf,

    /// Model used by the semantic tier (part of the scan cache key)
    pub scan_model: String,

    /// Scan cache TTL in seconds
    pub scan_cache_ttl_secs: u64,

    /// Scan cache capacity in entries
    pub scan_cache_capacity: u64,

    pub scanner: ScannerConfig,
    pub sandbox: SandboxConfig,
    pub registry: RegistryConfig,

    /// Emit JSON logs to stderr
    pub log_json: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let anthropic_api_key = var("ANTHROPIC_API_KEY");
        let anthropic_api_url = var("SKILLBOX_ANTHROPIC_URL");

        let db_path = match var("SKILLBOX_DB_PATH") {
            Some(raw) => PathBuf::from(
                shellexpand::full(&raw)
                    .with_context(|| format!("expanding SKILLBOX_DB_PATH={}", raw))?
                    .into_owned(),
            ),
            None => dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("skillbox")
                .join("registry.db"),
        };

        let scan_model = var("SKILLBOX_SCAN_MODEL").unwrap_or_else(|| DEFAULT_SCAN_MODEL.to_string());
        let scan_cache_ttl_secs = parse_or(&var, "SKILLBOX_SCAN_CACHE_TTL", 24 * 3600)?;
        let scan_cache_capacity = parse_or(&var, "SKILLBOX_SCAN_CACHE_CAPACITY", 10_000)?;

        let scanner = ScannerConfig {
            semantic_timeout: Duration::from_secs(parse_or(&var, "SKILLBOX_SCAN_TIMEOUT_SECS", 30)?),
            ..Default::default()
        };

        // Sandbox
        let mut sandbox = SandboxConfig::default();
        if let Some(runtime) = var("SKILLBOX_RUNTIME") {
            sandbox.runtime = runtime;
        }
        if let Some(image) = var("SKILLBOX_PYTHON_IMAGE") {
            sandbox.python_image = image;
        }
        if let Some(image) = var("SKILLBOX_NODE_IMAGE") {
            sandbox.node_image = image;
        }
        if let Some(image) = var("SKILLBOX_SHELL_IMAGE") {
            sandbox.shell_image = image;
        }
        sandbox.max_output_bytes = parse_or(&var, "SKILLBOX_MAX_OUTPUT_BYTES", sandbox.max_output_bytes)?;

        let defaults = ResourceLimits::default();
        let limits = ResourceLimits {
            memory_mb: parse_or(&var, "SKILLBOX_MEMORY_MB", defaults.memory_mb)?,
            cpus: parse_or(&var, "SKILLBOX_CPUS", defaults.cpus)?,
            pids_max: parse_or(&var, "SKILLBOX_PIDS_MAX", defaults.pids_max)?,
            scratch_mb: parse_or(&var, "SKILLBOX_SCRATCH_MB", defaults.scratch_mb)?,
        };
        if limits.memory_mb == 0
            || limits.pids_max == 0
            || limits.scratch_mb == 0
            || !(limits.cpus.is_finite() && limits.cpus > 0.0)
        {
            return Err(anyhow!("resource limits must be positive and finite: {:?}", limits));
        }

        // Operator-configured limits widen the ceiling rather than being clamped by it
        sandbox.ceiling = ResourceLimits {
            memory_mb: sandbox.ceiling.memory_mb.max(limits.memory_mb),
            cpus: sandbox.ceiling.cpus.max(limits.cpus),
            pids_max: sandbox.ceiling.pids_max.max(limits.pids_max),
            scratch_mb: sandbox.ceiling.scratch_mb.max(limits.scratch_mb),
        };

        let exec_timeout_secs: u64 = parse_or(&var, "SKILLBOX_EXEC_TIMEOUT_SECS", 30)?;
        if exec_timeout_secs == 0 {
            return Err(anyhow!("SKILLBOX_EXEC_TIMEOUT_SECS must be positive"));
        }
        sandbox.max_timeout_secs = sandbox.max_timeout_secs.max(exec_timeout_secs);

        // Registry
        let policy_defaults = GovernancePolicy::default();
        let policy = GovernancePolicy::new(
            parse_or(&var, "SKILLBOX_INSTRUCTION_MIN_LEVEL", policy_defaults.instruction_min)?,
            parse_or(&var, "SKILLBOX_CODE_MIN_LEVEL", policy_defaults.code_min)?,
        );

        let registry = RegistryConfig {
            policy,
            exec_timeout: Duration::from_secs(exec_timeout_secs),
            limits,
            max_source_bytes: parse_or(&var, "SKILLBOX_MAX_SOURCE_BYTES", RegistryConfig::default().max_source_bytes)?,
        };

        let log_json = var("SKILLBOX_LOG_JSON")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        Ok(Self {
            anthropic_api_key,
            anthropic_api_url,
            db_path,
            scan_model,
            scan_cache_ttl_secs,
            scan_cache_capacity,
            scanner,
            sandbox,
            registry,
            log_json,
        })
    }
}

fn parse_or<T, F>(var: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| anyhow!("invalid {}={}: {}", key, raw, e)),
        None => Ok(default),
    }
}
