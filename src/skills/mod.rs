//! Community Skills
//!
//! # Architecture
//!
//! ```text
//! raw content ──► SkillParser ──► SecurityScanner ──► SkillStore
//!                                       │                 │
//!                                  risk level ──► initial trust state
//!
//! execute(skill, caller) ──► GovernanceResolver ──► instruction: render prompt
//!                                                └─► code: Sandbox (fresh container)
//!                                                          │
//!                                            ExecutionRecord ──► AuditSink
//! ```
//!
//! # Skill Format
//!
//! TOML manifests, Markdown with front-matter, or bare scripts with a
//! shebang line. See [`parser`].
//!
//! # Security
//!
//! Code runs only inside an ephemeral container:
//! - No network, read-only root, size-capped tmpfs scratch
//! - Memory, CPU and process-count ceilings
//! - Torn down on every exit path, including panics

pub mod parser;
pub mod registry;
pub mod sandbox;
pub mod store;
pub mod types;

pub use parser::{ManifestParser, SkillParser};
pub use registry::{
    render_instruction, ExecuteError, ExecutionResponse, ImportError, ImportItem, ImportReport, ImportSummary,
    RegistryConfig, RegistryError, SkillRegistry,
};
pub use sandbox::{
    ContainerSandbox, ExecutionRequest, InputBindings, ResourceLimits, Sandbox, SandboxConfig, SandboxError,
    SandboxRun,
};
pub use store::SkillStore;
pub use types::{
    ExecutionOutcome, ExecutionRecord, Language, ParsedSkill, ResourceUsage, RiskLevel, Skill, SkillKind,
    SkillSummary, TransitionRecord, TrustState,
};
