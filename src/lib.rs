//! Skillbox
//!
//! Runs untrusted community skills without granting host access.
//!
//! # Features
//!
//! - **Sandbox**: one fresh, network-less, resource-capped container per run
//! - **Two-tier scanner**: static signatures, then a language-model review
//! - **Scan cache**: content-addressed (SHA-256), computed once per fingerprint
//! - **Lifecycle**: Untrusted → Active → Banned, with an audit trail
//! - **Governance**: caller tiers gate code execution
//!
//! # Architecture
//!
//! ```text
//! import ──► SkillRegistry ──► SecurityScanner ──► Claude API
//!                 │                  └── ScanCache (Moka)
//!                 ├── SkillStore (SQLite)
//!                 ├── GovernanceResolver
//!                 ├── AuditSink
//!                 └── Sandbox (docker/podman)
//! ```

pub mod audit;
pub mod cache;
pub mod claude;
pub mod config;
pub mod governance;
pub mod scanner;
pub mod skills;

pub use audit::{AuditSink, NullAuditSink, TracingAuditSink};
pub use cache::{CacheStats, ScanCache, ScanKey};
pub use claude::ClaudeClient;
pub use config::Config;
pub use governance::{GovernanceCheck, GovernanceLevel, GovernancePolicy, GovernanceResolver, StaticGovernance};
pub use scanner::{
    fingerprint, AnalyzerError, ClaudeAnalyzer, ScanMethod, ScanResult, ScanVerdict, ScannerConfig, SecurityScanner,
    SemanticAnalyzer, SemanticAssessment,
};
pub use skills::{
    ContainerSandbox, ExecuteError, ExecutionOutcome, ExecutionRecord, ExecutionResponse, ImportError, ImportItem,
    ImportReport, ImportSummary, InputBindings, ManifestParser, RegistryConfig, RegistryError, ResourceLimits,
    RiskLevel, Sandbox, SandboxConfig, SandboxError, Skill, SkillKind, SkillParser, SkillRegistry, SkillStore,
    SkillSummary, TrustState,
};
