//! Caller Governance
//!
//! Tiered access control for skill execution:
//! - **Restricted**: may use instruction-only skills, never runs code
//! - **Supervised**: may run executable-code skills
//! - **Autonomous**: full access
//!
//! Level lookup belongs to the platform; the registry only sees it through
//! [`GovernanceResolver`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

use crate::skills::types::{SkillKind, UnknownVariant};

/// Caller permission tier, ordered lowest to highest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GovernanceLevel {
    /// Lowest tier; categorically blocked from code execution
    Restricted,
    /// Can run sandboxed code
    Supervised,
    /// Full access
    Autonomous,
}

impl Default for GovernanceLevel {
    fn default() -> Self {
        GovernanceLevel::Restricted
    }
}

impl GovernanceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            GovernanceLevel::Restricted => "restricted",
            GovernanceLevel::Supervised => "supervised",
            GovernanceLevel::Autonomous => "autonomous",
        }
    }
}

impl fmt::Display for GovernanceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GovernanceLevel {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "restricted" => Ok(GovernanceLevel::Restricted),
            "supervised" => Ok(GovernanceLevel::Supervised),
            "autonomous" => Ok(GovernanceLevel::Autonomous),
            _ => Err(UnknownVariant::new("governance level", s)),
        }
    }
}

/// Opaque lookup of a caller's governance level
#[async_trait]
pub trait GovernanceResolver: Send + Sync {
    async fn resolve(&self, caller_id: &str) -> GovernanceLevel;
}

/// Fixed caller table with a default level for unknown callers
pub struct StaticGovernance {
    levels: RwLock<HashMap<String, GovernanceLevel>>,
    default_level: GovernanceLevel,
}

impl StaticGovernance {
    pub fn new(default_level: GovernanceLevel) -> Self {
        Self {
            levels: RwLock::new(HashMap::new()),
            default_level,
        }
    }

    /// Builder-style registration
    pub fn with_caller(self, caller_id: &str, level: GovernanceLevel) -> Self {
        self.set(caller_id, level);
        self
    }

    pub fn set(&self, caller_id: &str, level: GovernanceLevel) {
        if let Ok(mut levels) = self.levels.write() {
            levels.insert(caller_id.to_string(), level);
        }
    }
}

impl Default for StaticGovernance {
    fn default() -> Self {
        Self::new(GovernanceLevel::Restricted)
    }
}

#[async_trait]
impl GovernanceResolver for StaticGovernance {
    async fn resolve(&self, caller_id: &str) -> GovernanceLevel {
        self.levels
            .read()
            .ok()
            .and_then(|levels| levels.get(caller_id).copied())
            .unwrap_or(self.default_level)
    }
}

/// Minimum levels per skill kind
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GovernancePolicy {
    pub instruction_min: GovernanceLevel,
    pub code_min: GovernanceLevel,
}

impl Default for GovernancePolicy {
    fn default() -> Self {
        Self {
            instruction_min: GovernanceLevel::Restricted,
            code_min: GovernanceLevel::Supervised,
        }
    }
}

impl GovernancePolicy {
    /// Build a policy, keeping the lowest tier out of code execution and
    /// never letting instructions demand more than code.
    pub fn new(instruction_min: GovernanceLevel, code_min: GovernanceLevel) -> Self {
        let code_min = code_min.max(GovernanceLevel::Supervised);
        Self {
            instruction_min: instruction_min.min(code_min),
            code_min,
        }
    }

    pub fn required_level(&self, kind: &SkillKind) -> GovernanceLevel {
        match kind {
            SkillKind::InstructionOnly => self.instruction_min,
            SkillKind::ExecutableCode { .. } => self.code_min,
        }
    }

    pub fn check(&self, kind: &SkillKind, level: GovernanceLevel) -> GovernanceCheck {
        let required = self.required_level(kind);
        if level >= required {
            GovernanceCheck::Allowed
        } else {
            GovernanceCheck::Denied { required, actual: level }
        }
    }
}

/// Result of a governance check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernanceCheck {
    Allowed,
    Denied {
        required: GovernanceLevel,
        actual: GovernanceLevel,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skills::types::Language;

    fn code() -> SkillKind {
        SkillKind::ExecutableCode {
            language: Language::Python,
        }
    }

    #[test]
    fn test_levels_are_ordered() {
        assert!(GovernanceLevel::Restricted < GovernanceLevel::Supervised);
        assert!(GovernanceLevel::Supervised < GovernanceLevel::Autonomous);
    }

    #[test]
    fn test_lowest_tier_never_runs_code() {
        let policy = GovernancePolicy::new(GovernanceLevel::Restricted, GovernanceLevel::Restricted);
        assert_eq!(policy.code_min, GovernanceLevel::Supervised);
        assert!(matches!(
            policy.check(&code(), GovernanceLevel::Restricted),
            GovernanceCheck::Denied { .. }
        ));
        assert_eq!(
            policy.check(&SkillKind::InstructionOnly, GovernanceLevel::Restricted),
            GovernanceCheck::Allowed
        );
    }

    #[test]
    fn test_instruction_bar_never_above_code_bar() {
        let policy = GovernancePolicy::new(GovernanceLevel::Autonomous, GovernanceLevel::Supervised);
        assert_eq!(policy.instruction_min, GovernanceLevel::Supervised);
    }

    #[tokio::test]
    async fn test_static_governance_defaults() {
        let gov = StaticGovernance::new(GovernanceLevel::Restricted)
            .with_caller("ops", GovernanceLevel::Autonomous);

        assert_eq!(gov.resolve("ops").await, GovernanceLevel::Autonomous);
        assert_eq!(gov.resolve("stranger").await, GovernanceLevel::Restricted);
    }

    #[test]
    fn test_static_governance_set_overrides() {
        let gov = StaticGovernance::default();
        gov.set("ci", GovernanceLevel::Supervised);
        gov.set("ci", GovernanceLevel::Autonomous);

        assert_eq!(tokio_test::block_on(gov.resolve("ci")), GovernanceLevel::Autonomous);
    }

    #[test]
    fn test_level_parsing() {
        assert_eq!(
            "Supervised".parse::<GovernanceLevel>().unwrap(),
            GovernanceLevel::Supervised
        );
        assert!("root".parse::<GovernanceLevel>().is_err());
    }
}
