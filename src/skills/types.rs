//! Skill Type Definitions
//!
//! Core data structures shared by the parser, scanner, sandbox and registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::governance::GovernanceLevel;

/// Interpreted languages the sandbox knows how to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    #[serde(alias = "js", alias = "node")]
    JavaScript,
    #[serde(alias = "sh", alias = "bash")]
    Shell,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Shell => "shell",
        }
    }

    /// Map a free-form hint (fence info string, file extension, manifest field)
    pub fn from_hint(hint: &str) -> Option<Self> {
        match hint.trim().to_lowercase().as_str() {
            "python" | "python3" | "py" => Some(Language::Python),
            "javascript" | "js" | "node" | "nodejs" | "mjs" => Some(Language::JavaScript),
            "shell" | "sh" | "bash" => Some(Language::Shell),
            _ => None,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a skill is, decided once at parse time and never re-derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SkillKind {
    /// Natural-language instructions rendered into a prompt
    InstructionOnly,
    /// Source code run inside the sandbox
    ExecutableCode { language: Language },
}

impl SkillKind {
    pub fn is_code(&self) -> bool {
        matches!(self, SkillKind::ExecutableCode { .. })
    }

    pub fn language(&self) -> Option<Language> {
        match self {
            SkillKind::ExecutableCode { language } => Some(*language),
            SkillKind::InstructionOnly => None,
        }
    }

    /// Storage encoding: `instruction` or `code:<language>`
    pub fn encode(&self) -> String {
        match self {
            SkillKind::InstructionOnly => "instruction".to_string(),
            SkillKind::ExecutableCode { language } => format!("code:{}", language.as_str()),
        }
    }

    pub fn decode(s: &str) -> Result<Self, UnknownVariant> {
        if s == "instruction" {
            return Ok(SkillKind::InstructionOnly);
        }
        s.strip_prefix("code:")
            .and_then(Language::from_hint)
            .map(|language| SkillKind::ExecutableCode { language })
            .ok_or_else(|| UnknownVariant::new("skill kind", s))
    }
}

/// Lifecycle tag gating whether a skill may execute code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustState {
    /// Imported but not cleared for unattended use
    Untrusted,
    /// Cleared, either automatically (risk Low) or by an administrator
    Active,
    /// Manually demoted; terminal
    Banned,
}

impl TrustState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustState::Untrusted => "untrusted",
            TrustState::Active => "active",
            TrustState::Banned => "banned",
        }
    }
}

impl fmt::Display for TrustState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrustState {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "untrusted" => Ok(TrustState::Untrusted),
            "active" => Ok(TrustState::Active),
            "banned" => Ok(TrustState::Banned),
            _ => Err(UnknownVariant::new("trust state", s)),
        }
    }
}

/// Scanner risk classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
    /// The semantic tier could not be consulted (fail-open)
    Unknown,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
            RiskLevel::Unknown => "unknown",
        }
    }

    /// Trust state a freshly imported skill starts in.
    ///
    /// Only `Low` is auto-promoted; `Unknown` lands in the least-trusted state.
    pub fn initial_trust(&self) -> TrustState {
        match self {
            RiskLevel::Low => TrustState::Active,
            _ => TrustState::Untrusted,
        }
    }

    /// Ordering among assessed levels; `Unknown` has no rank
    pub fn severity(&self) -> Option<u8> {
        match self {
            RiskLevel::Low => Some(0),
            RiskLevel::Medium => Some(1),
            RiskLevel::High => Some(2),
            RiskLevel::Critical => Some(3),
            RiskLevel::Unknown => None,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            "critical" => Ok(RiskLevel::Critical),
            "unknown" => Ok(RiskLevel::Unknown),
            _ => Err(UnknownVariant::new("risk level", s)),
        }
    }
}

/// Output of the parser collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSkill {
    pub name: String,
    pub description: String,
    pub kind: SkillKind,
    /// Instruction text or program source, depending on `kind`
    pub source_body: String,
}

/// A persisted skill
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skill {
    pub id: String,
    pub name: String,
    pub description: String,
    pub kind: SkillKind,
    pub source: String,
    /// SHA-256 hex of `source`
    pub fingerprint: String,
    pub trust_state: TrustState,
    pub risk_level: RiskLevel,
    pub findings: Vec<String>,
    /// Where the skill came from (URL, path, hub reference)
    pub origin: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Skill {
    pub fn summary(&self) -> SkillSummary {
        SkillSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: self.kind,
            trust_state: self.trust_state,
            risk_level: self.risk_level,
            origin: self.origin.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// Listing row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillSummary {
    pub id: String,
    pub name: String,
    pub kind: SkillKind,
    pub trust_state: TrustState,
    pub risk_level: RiskLevel,
    pub origin: String,
    pub updated_at: DateTime<Utc>,
}

/// How an execution attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionOutcome {
    Success,
    /// Guest exited non-zero or raised
    Error,
    /// Wall-clock budget exceeded, environment force-removed
    Timeout,
    /// Blocked before any environment was created
    Denied,
    /// The isolation runtime itself failed
    Fault,
}

impl ExecutionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionOutcome::Success => "success",
            ExecutionOutcome::Error => "error",
            ExecutionOutcome::Timeout => "timeout",
            ExecutionOutcome::Denied => "denied",
            ExecutionOutcome::Fault => "fault",
        }
    }
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionOutcome {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(ExecutionOutcome::Success),
            "error" => Ok(ExecutionOutcome::Error),
            "timeout" => Ok(ExecutionOutcome::Timeout),
            "denied" => Ok(ExecutionOutcome::Denied),
            "fault" => Ok(ExecutionOutcome::Fault),
            _ => Err(UnknownVariant::new("execution outcome", s)),
        }
    }
}

/// Resource usage snapshot attached to an execution record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub wall_time_ms: u64,
    pub stdout_bytes: usize,
    pub stderr_bytes: usize,
    pub output_truncated: bool,
    pub memory_limit_mb: u64,
    pub cpu_limit: f64,
    pub pids_limit: u32,
    /// Runtime reported an out-of-memory kill
    pub oom_killed: bool,
}

/// One execution attempt. Written once by the registry, never updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub skill_id: String,
    pub caller_id: String,
    pub governance_level: GovernanceLevel,
    /// Set only when an isolated environment was actually created
    pub environment_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: ExecutionOutcome,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub usage: ResourceUsage,
}

/// Audit row for a trust-state change attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub skill_id: String,
    pub from_state: TrustState,
    pub to_state: TrustState,
    /// `system` for automatic promotion, otherwise the administrator
    pub actor: String,
    pub reason: String,
    /// False when the attempt was rejected
    pub applied: bool,
    pub at: DateTime<Utc>,
}

/// A stored string did not match any known variant
#[derive(Debug, Clone, thiserror::Error)]
#[error("Unknown {kind}: {value}")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

impl UnknownVariant {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_low_risk_starts_active() {
        assert_eq!(RiskLevel::Low.initial_trust(), TrustState::Active);
        for risk in [
            RiskLevel::Medium,
            RiskLevel::High,
            RiskLevel::Critical,
            RiskLevel::Unknown,
        ] {
            assert_eq!(risk.initial_trust(), TrustState::Untrusted, "{risk}");
        }
    }

    #[test]
    fn test_skill_kind_encoding() {
        let kind = SkillKind::ExecutableCode {
            language: Language::Python,
        };
        assert_eq!(kind.encode(), "code:python");
        assert_eq!(SkillKind::decode("code:python").unwrap(), kind);
        assert_eq!(
            SkillKind::decode("instruction").unwrap(),
            SkillKind::InstructionOnly
        );
        assert!(SkillKind::decode("code:cobol").is_err());
    }

    #[test]
    fn test_language_hints() {
        assert_eq!(Language::from_hint("py"), Some(Language::Python));
        assert_eq!(Language::from_hint("Node"), Some(Language::JavaScript));
        assert_eq!(Language::from_hint("bash"), Some(Language::Shell));
        assert_eq!(Language::from_hint("rust"), None);
    }

    #[test]
    fn test_state_round_trip_through_strings() {
        assert_eq!("BANNED".parse::<TrustState>().unwrap(), TrustState::Banned);
        assert_eq!("unknown".parse::<RiskLevel>().unwrap(), RiskLevel::Unknown);
        assert!("maybe".parse::<TrustState>().is_err());
    }
}
