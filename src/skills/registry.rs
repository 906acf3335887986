//! Skill Registry
//!
//! Owns the skill lifecycle and is the only writer of skills, execution
//! records and transition records.
//!
//! ```text
//!            import (risk = low)
//!   ──────────────────────────────► Active ──ban──► Banned
//!   │ import (anything else)          ▲                ▲
//!   ▼                                 │ promote        │ ban
//!  Untrusted ─────────────────────────┴────────────────┘
//! ```
//!
//! Execution: Banned → denied; below governance minimum → denied;
//! instruction-only → rendered prompt; executable code → sandbox.
//! Every attempt on an existing skill leaves an [`ExecutionRecord`].

use anyhow::anyhow;
use chrono::Utc;
use futures_util::future::join_all;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::parser::{ManifestParser, SkillParser};
use super::sandbox::{ExecutionRequest, InputBindings, ResourceLimits, Sandbox, SandboxError};
use super::store::SkillStore;
use super::types::{
    ExecutionOutcome, ExecutionRecord, ParsedSkill, ResourceUsage, RiskLevel, Skill, SkillKind, SkillSummary,
    TransitionRecord, TrustState,
};
use crate::audit::{AuditSink, TracingAuditSink};
use crate::governance::{GovernanceCheck, GovernanceLevel, GovernancePolicy, GovernanceResolver, StaticGovernance};
use crate::scanner::{self, ScanResult, SecurityScanner};

/// Actor recorded for automatic transitions
pub const SYSTEM_ACTOR: &str = "system";

/// Registry configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub policy: GovernancePolicy,
    /// Wall-clock budget handed to the sandbox
    pub exec_timeout: Duration,
    /// Requested per-run limits (the sandbox clamps them to its ceiling)
    pub limits: ResourceLimits,
    /// Raw content larger than this is refused at import
    pub max_source_bytes: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            policy: GovernancePolicy::default(),
            exec_timeout: Duration::from_secs(30),
            limits: ResourceLimits::default(),
            max_source_bytes: 256 * 1024,
        }
    }
}

/// Per-skill import failure; never aborts a batch
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("Failed to parse skill: {0}")]
    Parse(String),

    #[error("Skill content is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("Registry storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/// Execution failures that are not guest outcomes
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("Skill not found: {0}")]
    NotFound(String),

    #[error("Skill {skill_id} is banned")]
    Banned { skill_id: String, execution_id: String },

    #[error("Governance level {actual} is below the required {required}")]
    GovernanceDenied {
        required: GovernanceLevel,
        actual: GovernanceLevel,
        execution_id: String,
    },

    #[error("Invalid execution input: {message}")]
    InvalidInput { message: String, execution_id: String },

    #[error("Sandbox infrastructure failure: {message}")]
    Infrastructure { message: String, execution_id: String },

    #[error("Registry storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl ExecuteError {
    /// Id of the execution record written for this failure, if any
    pub fn execution_id(&self) -> Option<&str> {
        match self {
            ExecuteError::Banned { execution_id, .. }
            | ExecuteError::GovernanceDenied { execution_id, .. }
            | ExecuteError::InvalidInput { execution_id, .. }
            | ExecuteError::Infrastructure { execution_id, .. } => Some(execution_id),
            ExecuteError::NotFound(_) | ExecuteError::Storage(_) => None,
        }
    }
}

/// Administrative transition failures
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Skill not found: {0}")]
    NotFound(String),

    #[error("Cannot move skill {skill_id} from {from} to {to}")]
    InvalidTransition {
        skill_id: String,
        from: TrustState,
        to: TrustState,
    },

    #[error("Skill {0} has critical risk and cannot be promoted")]
    CriticalRisk(String),

    #[error("Registry storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/// Result of importing one skill
#[derive(Debug, Clone)]
pub struct ImportReport {
    pub skill_id: String,
    pub name: String,
    pub trust_state: TrustState,
    pub risk_level: RiskLevel,
    pub findings: Vec<String>,
    /// Content was already registered; the existing skill is reported
    pub deduplicated: bool,
}

impl ImportReport {
    fn from_skill(skill: &Skill, deduplicated: bool) -> Self {
        Self {
            skill_id: skill.id.clone(),
            name: skill.name.clone(),
            trust_state: skill.trust_state,
            risk_level: skill.risk_level,
            findings: skill.findings.clone(),
            deduplicated,
        }
    }
}

/// One item of a batch import
#[derive(Debug, Clone)]
pub struct ImportItem {
    pub source: String,
    pub origin: String,
}

/// Outcome of a batch import, in input order
#[derive(Debug)]
pub struct ImportSummary {
    pub imported: usize,
    pub failed: usize,
    pub outcomes: Vec<Result<ImportReport, ImportError>>,
}

/// Successful execution attempt (guest errors and timeouts included)
#[derive(Debug, Clone)]
pub enum ExecutionResponse {
    /// Instruction-only skill rendered into a prompt; no sandbox involved
    Prompt { prompt: String, record: ExecutionRecord },
    /// Code ran in the sandbox; see `record.outcome`
    Code(ExecutionRecord),
}

impl ExecutionResponse {
    pub fn record(&self) -> &ExecutionRecord {
        match self {
            ExecutionResponse::Prompt { record, .. } => record,
            ExecutionResponse::Code(record) => record,
        }
    }

    pub fn outcome(&self) -> ExecutionOutcome {
        self.record().outcome
    }
}

/// Registry wiring parse → scan → store → promote → execute
pub struct SkillRegistry {
    store: Mutex<SkillStore>,
    parser: Arc<dyn SkillParser>,
    scanner: Arc<SecurityScanner>,
    sandbox: Arc<dyn Sandbox>,
    governance: Arc<dyn GovernanceResolver>,
    audit: Arc<dyn AuditSink>,
    config: RegistryConfig,
}

impl SkillRegistry {
    /// Registry with the default parser, a restricted-by-default governance
    /// table and the tracing audit sink
    pub fn new(store: SkillStore, scanner: Arc<SecurityScanner>, sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            store: Mutex::new(store),
            parser: Arc::new(ManifestParser),
            scanner,
            sandbox,
            governance: Arc::new(StaticGovernance::default()),
            audit: Arc::new(TracingAuditSink),
            config: RegistryConfig::default(),
        }
    }

    pub fn with_parser(mut self, parser: Arc<dyn SkillParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_governance(mut self, governance: Arc<dyn GovernanceResolver>) -> Self {
        self.governance = governance;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn scanner(&self) -> &SecurityScanner {
        &self.scanner
    }

    /// Held for single statements only, never across an await
    fn store(&self) -> anyhow::Result<MutexGuard<'_, SkillStore>> {
        self.store.lock().map_err(|_| anyhow!("registry store lock poisoned"))
    }

    // ========== Import ==========

    /// Parse, scan and persist one skill
    pub async fn import(&self, source: &str, origin: &str) -> Result<ImportReport, ImportError> {
        if source.len() > self.config.max_source_bytes {
            return Err(ImportError::TooLarge {
                size: source.len(),
                limit: self.config.max_source_bytes,
            });
        }
        if source.trim().is_empty() {
            return Err(ImportError::Parse("empty skill content".to_string()));
        }

        let parsed = self.parser.parse(source);
        if parsed.source_body.trim().is_empty() {
            return Err(ImportError::Parse(format!(
                "skill '{}' has no {} body",
                parsed.name,
                if parsed.kind.is_code() { "code" } else { "instruction" }
            )));
        }

        let fingerprint = scanner::fingerprint(&parsed.source_body);
        let existing = self.store()?.find_by_fingerprint(&fingerprint)?;
        if let Some(existing) = existing {
            debug!(skill_id = %existing.id, origin, "Content already registered");
            if existing.risk_level == RiskLevel::Unknown {
                return self.rescan(existing).await;
            }
            return Ok(ImportReport::from_skill(&existing, true));
        }

        let skill_id = uuid::Uuid::new_v4().to_string();
        let scan = self.scanner.scan(&skill_id, &parsed.source_body).await;
        let skill = new_skill(skill_id, parsed, origin, scan);

        let store = self.store()?;
        if !store.insert_skill(&skill)? {
            // Lost a race with a concurrent import of the same content
            let existing = store
                .find_by_fingerprint(&skill.fingerprint)?
                .ok_or_else(|| anyhow!("skill with fingerprint {} vanished", skill.fingerprint))?;
            return Ok(ImportReport::from_skill(&existing, true));
        }

        if skill.trust_state == TrustState::Active {
            store.insert_transition(&TransitionRecord {
                skill_id: skill.id.clone(),
                from_state: TrustState::Untrusted,
                to_state: TrustState::Active,
                actor: SYSTEM_ACTOR.to_string(),
                reason: "risk low at import".to_string(),
                applied: true,
                at: skill.created_at,
            })?;
        }
        drop(store);

        info!(
            skill_id = %skill.id,
            name = %skill.name,
            kind = %skill.kind.encode(),
            risk = %skill.risk_level,
            trust = %skill.trust_state,
            origin,
            "Skill imported"
        );
        Ok(ImportReport::from_skill(&skill, false))
    }

    /// Retry the scan of a skill first registered while the scanner was
    /// unavailable. A now-Low skill that is still Untrusted becomes Active.
    async fn rescan(&self, existing: Skill) -> Result<ImportReport, ImportError> {
        let scan = self.scanner.scan(&existing.id, &existing.source).await;
        if scan.risk_level == RiskLevel::Unknown {
            return Ok(ImportReport::from_skill(&existing, true));
        }

        let at = Utc::now();
        let store = self.store()?;
        let updated = store.update_risk(&existing.id, RiskLevel::Unknown, scan.risk_level, &scan.findings, at)?;

        if updated && scan.risk_level.initial_trust() == TrustState::Active {
            let promoted = store.update_trust(&existing.id, TrustState::Untrusted, TrustState::Active, at)?;
            if promoted {
                store.insert_transition(&TransitionRecord {
                    skill_id: existing.id.clone(),
                    from_state: TrustState::Untrusted,
                    to_state: TrustState::Active,
                    actor: SYSTEM_ACTOR.to_string(),
                    reason: "risk low on rescan".to_string(),
                    applied: true,
                    at,
                })?;
            }
        }

        let current = store
            .get(&existing.id)?
            .ok_or_else(|| anyhow!("skill {} vanished during rescan", existing.id))?;
        drop(store);

        if updated {
            info!(
                skill_id = %current.id,
                risk = %current.risk_level,
                trust = %current.trust_state,
                "Skill rescanned"
            );
        }
        Ok(ImportReport::from_skill(&current, true))
    }

    /// Import independently and concurrently; failures stay per-item
    pub async fn import_batch(&self, items: &[ImportItem]) -> ImportSummary {
        let outcomes = join_all(items.iter().map(|item| self.import(&item.source, &item.origin))).await;

        let imported = outcomes.iter().filter(|o| o.is_ok()).count();
        let failed = outcomes.len() - imported;
        for (item, outcome) in items.iter().zip(&outcomes) {
            if let Err(e) = outcome {
                warn!(origin = %item.origin, "Skill import failed: {}", e);
            }
        }
        info!(imported, failed, "Batch import complete");

        ImportSummary {
            imported,
            failed,
            outcomes,
        }
    }

    // ========== Execution ==========

    /// Run a skill on behalf of `caller_id`
    pub async fn execute(
        &self,
        skill_id: &str,
        caller_id: &str,
        inputs: InputBindings,
    ) -> Result<ExecutionResponse, ExecuteError> {
        let started_at = Utc::now();
        let skill = self
            .store()?
            .get(skill_id)?
            .ok_or_else(|| ExecuteError::NotFound(skill_id.to_string()))?;
        let level = self.governance.resolve(caller_id).await;

        let attempt = Attempt {
            skill_id,
            caller_id,
            level,
            started_at,
        };

        if skill.trust_state == TrustState::Banned {
            let record = self.finish(attempt.denied("skill is banned"))?;
            return Err(ExecuteError::Banned {
                skill_id: skill_id.to_string(),
                execution_id: record.id,
            });
        }

        if let GovernanceCheck::Denied { required, actual } = self.config.policy.check(&skill.kind, level) {
            let record = self.finish(attempt.denied(&format!(
                "governance level {} below required {}",
                actual, required
            )))?;
            return Err(ExecuteError::GovernanceDenied {
                required,
                actual,
                execution_id: record.id,
            });
        }

        let language = match skill.kind {
            SkillKind::InstructionOnly => {
                let prompt = render_instruction(&skill.source, &inputs);
                let mut record = attempt.record(ExecutionOutcome::Success, None);
                record.stdout = prompt.clone();
                let record = self.finish(record)?;
                return Ok(ExecutionResponse::Prompt { prompt, record });
            }
            SkillKind::ExecutableCode { language } => language,
        };

        let request = ExecutionRequest {
            language,
            code: skill.source,
            inputs,
            timeout: self.config.exec_timeout,
            limits: self.config.limits,
        };

        match self.sandbox.execute(request).await {
            Ok(run) => {
                let mut record = attempt.record(ExecutionOutcome::Success, Some(run.environment_id));
                record.exit_code = Some(run.exit_code);
                record.stdout = run.stdout;
                record.stderr = run.stderr;
                record.usage = run.usage;
                Ok(ExecutionResponse::Code(self.finish(record)?))
            }
            Err(SandboxError::Execution { run }) => {
                let mut record = attempt.record(ExecutionOutcome::Error, Some(run.environment_id));
                record.exit_code = Some(run.exit_code);
                record.stdout = run.stdout;
                record.stderr = run.stderr;
                record.usage = run.usage;
                Ok(ExecutionResponse::Code(self.finish(record)?))
            }
            Err(SandboxError::Timeout {
                environment_id,
                timeout,
                usage,
            }) => {
                let mut record = attempt.record(ExecutionOutcome::Timeout, Some(environment_id));
                record.stderr = format!("execution exceeded {}s and was terminated", timeout.as_secs());
                record.usage = usage;
                Ok(ExecutionResponse::Code(self.finish(record)?))
            }
            Err(SandboxError::InvalidRequest(message)) => {
                let record = self.finish(attempt.denied(&message))?;
                Err(ExecuteError::InvalidInput {
                    message,
                    execution_id: record.id,
                })
            }
            Err(SandboxError::Infrastructure {
                environment_id,
                message,
            }) => {
                let mut record = attempt.record(ExecutionOutcome::Fault, environment_id);
                record.stderr = message.clone();
                let record = self.finish(record)?;
                Err(ExecuteError::Infrastructure {
                    message,
                    execution_id: record.id,
                })
            }
        }
    }

    /// Persist a completed record and hand it to the audit sink
    fn finish(&self, record: ExecutionRecord) -> Result<ExecutionRecord, ExecuteError> {
        self.store()?.insert_execution(&record)?;
        self.audit.append(&record);
        Ok(record)
    }

    // ========== Lifecycle ==========

    /// Untrusted → Active. Idempotent on Active skills.
    pub fn promote(&self, skill_id: &str, actor: &str) -> Result<TrustState, RegistryError> {
        let store = self.store()?;
        let skill = store
            .get(skill_id)?
            .ok_or_else(|| RegistryError::NotFound(skill_id.to_string()))?;

        match skill.trust_state {
            TrustState::Active => Ok(TrustState::Active),
            TrustState::Banned => {
                store.insert_transition(&rejected(
                    skill_id,
                    TrustState::Banned,
                    TrustState::Active,
                    actor,
                    "banned is terminal",
                ))?;
                Err(RegistryError::InvalidTransition {
                    skill_id: skill_id.to_string(),
                    from: TrustState::Banned,
                    to: TrustState::Active,
                })
            }
            TrustState::Untrusted if skill.risk_level == RiskLevel::Critical => {
                store.insert_transition(&rejected(
                    skill_id,
                    TrustState::Untrusted,
                    TrustState::Active,
                    actor,
                    "critical risk",
                ))?;
                Err(RegistryError::CriticalRisk(skill_id.to_string()))
            }
            TrustState::Untrusted => {
                let reason = format!("manual promotion (risk {})", skill.risk_level);
                apply(&store, skill_id, TrustState::Untrusted, TrustState::Active, actor, &reason)
            }
        }
    }

    /// Untrusted|Active → Banned. Terminal and idempotent.
    pub fn ban(&self, skill_id: &str, actor: &str, reason: &str) -> Result<TrustState, RegistryError> {
        let store = self.store()?;
        let skill = store
            .get(skill_id)?
            .ok_or_else(|| RegistryError::NotFound(skill_id.to_string()))?;

        match skill.trust_state {
            TrustState::Banned => Ok(TrustState::Banned),
            from => apply(&store, skill_id, from, TrustState::Banned, actor, reason),
        }
    }

    // ========== Inspection ==========

    pub fn list(&self, state: Option<TrustState>) -> anyhow::Result<Vec<SkillSummary>> {
        self.store()?.list(state)
    }

    pub fn get(&self, skill_id: &str) -> anyhow::Result<Option<Skill>> {
        self.store()?.get(skill_id)
    }

    pub fn executions(&self, skill_id: &str) -> anyhow::Result<Vec<ExecutionRecord>> {
        self.store()?.list_executions(skill_id)
    }

    pub fn transitions(&self, skill_id: &str) -> anyhow::Result<Vec<TransitionRecord>> {
        self.store()?.list_transitions(skill_id)
    }

    /// Live sandbox environments
    pub fn active_environments(&self) -> usize {
        self.sandbox.active_environments()
    }
}

/// Context shared by every record of one execute() call
struct Attempt<'a> {
    skill_id: &'a str,
    caller_id: &'a str,
    level: GovernanceLevel,
    started_at: chrono::DateTime<Utc>,
}

impl Attempt<'_> {
    fn record(&self, outcome: ExecutionOutcome, environment_id: Option<String>) -> ExecutionRecord {
        ExecutionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            skill_id: self.skill_id.to_string(),
            caller_id: self.caller_id.to_string(),
            governance_level: self.level,
            environment_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            outcome,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            usage: ResourceUsage::default(),
        }
    }

    fn denied(&self, reason: &str) -> ExecutionRecord {
        let mut record = self.record(ExecutionOutcome::Denied, None);
        record.stderr = reason.to_string();
        record
    }
}

fn new_skill(id: String, parsed: ParsedSkill, origin: &str, scan: ScanResult) -> Skill {
    let now = Utc::now();
    Skill {
        id,
        name: parsed.name,
        description: parsed.description,
        kind: parsed.kind,
        source: parsed.source_body,
        fingerprint: scan.fingerprint,
        trust_state: scan.risk_level.initial_trust(),
        risk_level: scan.risk_level,
        findings: scan.findings,
        origin: origin.to_string(),
        created_at: now,
        updated_at: now,
    }
}

fn rejected(skill_id: &str, from: TrustState, to: TrustState, actor: &str, reason: &str) -> TransitionRecord {
    TransitionRecord {
        skill_id: skill_id.to_string(),
        from_state: from,
        to_state: to,
        actor: actor.to_string(),
        reason: reason.to_string(),
        applied: false,
        at: Utc::now(),
    }
}

/// Conditional update plus audit row; a lost race reports the winner's state
fn apply(
    store: &SkillStore,
    skill_id: &str,
    from: TrustState,
    to: TrustState,
    actor: &str,
    reason: &str,
) -> Result<TrustState, RegistryError> {
    let at = Utc::now();
    let applied = store.update_trust(skill_id, from, to, at)?;
    store.insert_transition(&TransitionRecord {
        skill_id: skill_id.to_string(),
        from_state: from,
        to_state: to,
        actor: actor.to_string(),
        reason: reason.to_string(),
        applied,
        at,
    })?;

    if applied {
        info!(skill_id, %from, %to, actor, "Trust state changed");
        return Ok(to);
    }

    let current = store
        .get(skill_id)?
        .map(|s| s.trust_state)
        .ok_or_else(|| RegistryError::NotFound(skill_id.to_string()))?;
    if current == to {
        Ok(current)
    } else {
        Err(RegistryError::InvalidTransition {
            skill_id: skill_id.to_string(),
            from: current,
            to,
        })
    }
}

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").unwrap());

/// Substitute `{{key}}` placeholders; unknown ones stay, unused inputs are appended
pub fn render_instruction(template: &str, inputs: &InputBindings) -> String {
    let mut used = BTreeSet::new();
    let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures<'_>| match inputs.get(&caps[1]) {
        Some(value) => {
            used.insert(caps[1].to_string());
            value.clone()
        }
        None => caps[0].to_string(),
    });

    let mut prompt = rendered.into_owned();
    let unused: Vec<_> = inputs.iter().filter(|(k, _)| !used.contains(*k)).collect();
    if !unused.is_empty() {
        prompt.push_str("\n\nInputs:\n");
        for (key, value) in unused {
            prompt.push_str(&format!("- {}: {}\n", key, value));
        }
    }
    prompt
}
