//! Skill Sandbox
//!
//! Runs one untrusted snippet per call inside a freshly created container:
//! - No network (`--network none`)
//! - Read-only root, size-capped tmpfs scratch at `/scratch`
//! - Memory, CPU and pid ceilings enforced by the runtime
//! - All capabilities dropped, unprivileged user
//! - Hard wall-clock timeout enforced by forced removal
//!
//! # Lifecycle
//!
//! ```text
//! execute() ──► EnvironmentGuard::acquire ──► runtime run ──► capture
//!                        │                                     │
//!                        └──────── release (rm -f) ◄───────────┘
//!                                  (Drop fallback on panic/cancel)
//! ```
//!
//! Environments are never pooled; each gets a fresh `skillbox-<uuid>` id.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::types::{Language, ResourceUsage};

/// Flat key→value map injected into the guest's scope
pub type InputBindings = BTreeMap<String, String>;

/// Exit status the docker/podman CLI uses for its own failures
const RUNTIME_ERROR_STATUS: i32 = 125;

/// Per-environment resource ceilings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory (and memory+swap) in MiB
    pub memory_mb: u64,
    /// Fraction of CPU cores (0.5 = half a core)
    pub cpus: f64,
    /// Maximum number of processes
    pub pids_max: u32,
    /// Size of the writable scratch tmpfs in MiB
    pub scratch_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 256,
            cpus: 0.5,
            pids_max: 64,
            scratch_mb: 16,
        }
    }
}

impl ResourceLimits {
    /// Cap every field at `ceiling`
    pub fn clamp_to(&self, ceiling: &ResourceLimits) -> Self {
        Self {
            memory_mb: self.memory_mb.min(ceiling.memory_mb).max(1),
            cpus: self.cpus.min(ceiling.cpus).max(0.01),
            pids_max: self.pids_max.min(ceiling.pids_max).max(1),
            scratch_mb: self.scratch_mb.min(ceiling.scratch_mb).max(1),
        }
    }
}

/// Sandbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Container runtime binary (`docker` or `podman`)
    pub runtime: String,
    /// Leading arguments for every runtime call (e.g. `--context rootless`)
    pub runtime_args: Vec<String>,
    /// Image per language
    pub python_image: String,
    pub node_image: String,
    pub shell_image: String,
    /// Prefix for environment ids
    pub name_prefix: String,
    /// Upper bound for any requested timeout
    pub max_timeout_secs: u64,
    /// Upper bound for any requested limits
    pub ceiling: ResourceLimits,
    /// Captured bytes per stream
    pub max_output_bytes: usize,
    /// uid:gid inside the container
    pub user: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            runtime_args: Vec::new(),
            python_image: "python:3.12-alpine".to_string(),
            node_image: "node:22-alpine".to_string(),
            shell_image: "alpine:3.20".to_string(),
            name_prefix: "skillbox".to_string(),
            max_timeout_secs: 300,
            ceiling: ResourceLimits {
                memory_mb: 1024,
                cpus: 2.0,
                pids_max: 256,
                scratch_mb: 64,
            },
            max_output_bytes: 64 * 1024,
            user: "65534:65534".to_string(),
        }
    }
}

impl SandboxConfig {
    /// Strict sandbox - minimal ceilings
    pub fn strict() -> Self {
        Self {
            max_timeout_secs: 30,
            ceiling: ResourceLimits {
                memory_mb: 128,
                cpus: 0.5,
                pids_max: 32,
                scratch_mb: 8,
            },
            max_output_bytes: 16 * 1024,
            ..Default::default()
        }
    }

    fn image_for(&self, language: Language) -> &str {
        match language {
            Language::Python => &self.python_image,
            Language::JavaScript => &self.node_image,
            Language::Shell => &self.shell_image,
        }
    }
}

/// One execution request. Timeout and limits are mandatory.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub language: Language,
    pub code: String,
    pub inputs: InputBindings,
    pub timeout: Duration,
    pub limits: ResourceLimits,
}

/// A completed guest run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRun {
    pub environment_id: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub usage: ResourceUsage,
}

/// Sandbox failures
///
/// `Timeout` and `Execution` are guest failures; `Infrastructure` means the
/// platform could not run the code at all.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Invalid execution request: {0}")]
    InvalidRequest(String),

    #[error("Execution timed out after {}s in {environment_id}", .timeout.as_secs())]
    Timeout {
        environment_id: String,
        timeout: Duration,
        usage: ResourceUsage,
    },

    #[error("Guest exited with status {}", .run.exit_code)]
    Execution { run: SandboxRun },

    #[error("Sandbox infrastructure error: {message}")]
    Infrastructure {
        environment_id: Option<String>,
        message: String,
    },
}

/// Isolated code execution backend
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Run one request in a fresh environment that is gone when this returns
    async fn execute(&self, request: ExecutionRequest) -> Result<SandboxRun, SandboxError>;

    /// Environments currently alive
    fn active_environments(&self) -> usize;
}

/// Container-backed sandbox driving the docker/podman CLI
pub struct ContainerSandbox {
    config: SandboxConfig,
    active: Arc<AtomicUsize>,
}

impl ContainerSandbox {
    /// Create new sandbox with config
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Reject malformed requests before anything is created
    pub fn validate(&self, request: &ExecutionRequest) -> Result<(), SandboxError> {
        if request.code.trim().is_empty() {
            return Err(SandboxError::InvalidRequest("empty source".to_string()));
        }
        if request.timeout.is_zero() {
            return Err(SandboxError::InvalidRequest("timeout must be positive".to_string()));
        }
        for key in request.inputs.keys() {
            if !is_binding_name(key) {
                return Err(SandboxError::InvalidRequest(format!(
                    "input binding '{}' is not a valid identifier",
                    key
                )));
            }
        }
        Ok(())
    }

    /// Arguments for `runtime run`, everything after the runtime's own flags
    fn run_args(&self, environment_id: &str, request: &ExecutionRequest, limits: &ResourceLimits) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--name".to_string(),
            environment_id.to_string(),
            "--interactive".to_string(),
            "--network".to_string(),
            "none".to_string(),
            "--read-only".to_string(),
            "--tmpfs".to_string(),
            format!("/scratch:rw,nosuid,nodev,size={}m", limits.scratch_mb),
            "--workdir".to_string(),
            "/scratch".to_string(),
            "--memory".to_string(),
            format!("{}m", limits.memory_mb),
            "--memory-swap".to_string(),
            format!("{}m", limits.memory_mb),
            "--cpus".to_string(),
            format!("{}", limits.cpus),
            "--pids-limit".to_string(),
            limits.pids_max.to_string(),
            "--cap-drop".to_string(),
            "ALL".to_string(),
            "--security-opt".to_string(),
            "no-new-privileges".to_string(),
            "--user".to_string(),
            self.config.user.clone(),
            "--label".to_string(),
            format!("skillbox.environment={}", environment_id),
            "--env".to_string(),
            "HOME=/scratch".to_string(),
            // Values come from the client process env, never argv
            "--env".to_string(),
            "SKILL_INPUTS".to_string(),
        ];

        for key in request.inputs.keys() {
            args.push("--env".to_string());
            args.push(binding_env_name(key));
        }

        args.push(self.config.image_for(request.language).to_string());
        args.extend(interpreter_args(request.language).iter().map(|s| s.to_string()));
        args
    }

    fn runtime_command(&self) -> Command {
        let mut cmd = Command::new(&self.config.runtime);
        cmd.args(&self.config.runtime_args);
        cmd
    }

    /// Ask the runtime whether the container was OOM-killed
    async fn was_oom_killed(&self, environment_id: &str) -> bool {
        let output = self
            .runtime_command()
            .args(["inspect", "--format", "{{.State.OOMKilled}}", environment_id])
            .stdin(Stdio::null())
            .output()
            .await;

        match output {
            Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).trim() == "true",
            _ => false,
        }
    }
}

#[async_trait]
impl Sandbox for ContainerSandbox {
    async fn execute(&self, request: ExecutionRequest) -> Result<SandboxRun, SandboxError> {
        self.validate(&request)?;

        let timeout = request
            .timeout
            .min(Duration::from_secs(self.config.max_timeout_secs));
        let limits = request.limits.clamp_to(&self.config.ceiling);
        let environment_id = format!("{}-{}", self.config.name_prefix, uuid::Uuid::new_v4());

        let guard = EnvironmentGuard::acquire(
            &self.config.runtime,
            &self.config.runtime_args,
            &environment_id,
            self.active.clone(),
        );

        let inputs_json = serde_json::to_string(&request.inputs).map_err(|e| SandboxError::InvalidRequest(e.to_string()))?;

        let mut cmd = self.runtime_command();
        cmd.args(self.run_args(&environment_id, &request, &limits))
            .env("SKILL_INPUTS", &inputs_json)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &request.inputs {
            cmd.env(binding_env_name(key), value);
        }

        info!(
            environment_id = %environment_id,
            language = %request.language,
            timeout_secs = timeout.as_secs(),
            memory_mb = limits.memory_mb,
            "Creating sandbox environment"
        );

        let start = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                guard.release().await;
                return Err(SandboxError::Infrastructure {
                    environment_id: None,
                    message: format!("failed to start runtime '{}': {}", self.config.runtime, e),
                });
            }
        };

        let (Some(stdin), Some(mut stdout), Some(mut stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill().await;
            guard.release().await;
            return Err(SandboxError::Infrastructure {
                environment_id: Some(environment_id),
                message: "runtime process is missing stdio pipes".to_string(),
            });
        };

        // Fed inside the timed section; a guest may stop reading stdin
        let program = with_preamble(request.language, &request.inputs, &request.code);
        let feed = async {
            let mut stdin = stdin;
            if let Err(e) = stdin.write_all(program.as_bytes()).await {
                debug!(environment_id = %environment_id, "stdin closed early: {}", e);
            }
            // Dropping stdin closes it so the interpreter starts
        };

        let max_bytes = self.config.max_output_bytes;
        let collect = async {
            let ((), out, err) = tokio::join!(
                feed,
                read_capped(&mut stdout, max_bytes),
                read_capped(&mut stderr, max_bytes)
            );
            let status = child.wait().await;
            (out, err, status)
        };
        let waited = tokio::time::timeout(timeout, collect).await;

        let mut usage = ResourceUsage {
            wall_time_ms: start.elapsed().as_millis() as u64,
            memory_limit_mb: limits.memory_mb,
            cpu_limit: limits.cpus,
            pids_limit: limits.pids_max,
            ..Default::default()
        };

        let (out, err, status) = match waited {
            Ok(result) => result,
            Err(_) => {
                // Forced teardown first, then reap the client process
                guard.release().await;
                let _ = child.kill().await;
                warn!(
                    environment_id = %environment_id,
                    timeout_secs = timeout.as_secs(),
                    "Sandbox execution timed out; environment destroyed"
                );
                return Err(SandboxError::Timeout {
                    environment_id,
                    timeout,
                    usage,
                });
            }
        };

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                guard.release().await;
                return Err(SandboxError::Infrastructure {
                    environment_id: Some(environment_id),
                    message: format!("failed waiting on runtime: {}", e),
                });
            }
        };

        usage.stdout_bytes = out.total;
        usage.stderr_bytes = err.total;
        usage.output_truncated = out.truncated || err.truncated;
        usage.oom_killed = self.was_oom_killed(&environment_id).await;
        guard.release().await;

        let exit_code = status.code().unwrap_or(-1);
        let stderr_text = String::from_utf8_lossy(&err.bytes).to_string();

        if exit_code == RUNTIME_ERROR_STATUS {
            return Err(SandboxError::Infrastructure {
                environment_id: Some(environment_id),
                message: format!("runtime failed to create environment: {}", stderr_text.trim()),
            });
        }

        let run = SandboxRun {
            environment_id,
            exit_code,
            stdout: String::from_utf8_lossy(&out.bytes).to_string(),
            stderr: stderr_text,
            usage,
        };

        debug!(
            environment_id = %run.environment_id,
            exit_code,
            wall_time_ms = run.usage.wall_time_ms,
            "Sandbox execution finished"
        );

        if exit_code == 0 {
            Ok(run)
        } else {
            Err(SandboxError::Execution { run })
        }
    }

    fn active_environments(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

/// Scoped ownership of one environment.
///
/// `release()` removes the container; if the guard is dropped without it
/// (panic, cancelled future) `Drop` removes it on the blocking pool, or
/// inline when no runtime is running.
struct EnvironmentGuard {
    runtime: String,
    runtime_args: Vec<String>,
    environment_id: String,
    active: Arc<AtomicUsize>,
    released: bool,
}

impl EnvironmentGuard {
    fn acquire(runtime: &str, runtime_args: &[String], environment_id: &str, active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self {
            runtime: runtime.to_string(),
            runtime_args: runtime_args.to_vec(),
            environment_id: environment_id.to_string(),
            active,
            released: false,
        }
    }

    async fn release(mut self) {
        let result = Command::new(&self.runtime)
            .args(&self.runtime_args)
            .args(["rm", "--force", &self.environment_id])
            .stdin(Stdio::null())
            .output()
            .await;

        match result {
            Ok(out) if out.status.success() => {
                debug!(environment_id = %self.environment_id, "Environment removed");
            }
            Ok(out) => {
                // Already gone is fine: it never started or the runtime removed it
                debug!(
                    environment_id = %self.environment_id,
                    "rm returned {}: {}",
                    out.status,
                    String::from_utf8_lossy(&out.stderr).trim()
                );
            }
            Err(e) => {
                warn!(environment_id = %self.environment_id, "Failed to remove environment: {}", e);
            }
        }
        self.released = true;
    }
}

impl Drop for EnvironmentGuard {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                environment_id = %self.environment_id,
                "Environment guard dropped without release; removing container"
            );
            let mut rm = std::process::Command::new(&self.runtime);
            rm.args(&self.runtime_args)
                .args(["rm", "--force", &self.environment_id])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());

            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn_blocking(move || {
                        let _ = rm.status();
                    });
                }
                Err(_) => {
                    let _ = rm.status();
                }
            }
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Bytes captured from one stream
struct Captured {
    bytes: Vec<u8>,
    total: usize,
    truncated: bool,
}

/// Read a stream to EOF, keeping at most `max` bytes.
///
/// The remainder is drained so the guest never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(reader: &mut R, max: usize) -> Captured {
    let mut bytes = Vec::new();
    let mut total = 0usize;
    let mut buf = [0u8; 8192];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                total += n;
                let room = max.saturating_sub(bytes.len());
                bytes.extend_from_slice(&buf[..n.min(room)]);
            }
            Err(_) => break,
        }
    }

    Captured {
        truncated: total > bytes.len(),
        bytes,
        total,
    }
}

fn interpreter_args(language: Language) -> &'static [&'static str] {
    match language {
        Language::Python => &["python3", "-"],
        Language::JavaScript => &["node", "-"],
        Language::Shell => &["sh", "-s"],
    }
}

/// Bind inputs into the guest's scope ahead of the skill source
fn with_preamble(language: Language, inputs: &InputBindings, code: &str) -> String {
    let preamble = match language {
        Language::Python => "import json as _sb_json, os as _sb_os\n\
             inputs = _sb_json.loads(_sb_os.environ.get(\"SKILL_INPUTS\", \"{}\"))\n\
             globals().update(inputs)\n\
             del _sb_json, _sb_os\n"
            .to_string(),
        Language::JavaScript => "const inputs = JSON.parse(process.env.SKILL_INPUTS || \"{}\");\n\
             Object.assign(globalThis, inputs);\n"
            .to_string(),
        Language::Shell => inputs
            .keys()
            .map(|key| format!("{}=\"${{{}}}\"\n", key, binding_env_name(key)))
            .collect(),
    };
    format!("{}{}\n", preamble, code)
}

fn binding_env_name(key: &str) -> String {
    format!("SKILL_INPUT_{}", key)
}

fn is_binding_name(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
