//! Skill Registry Integration Tests
//!
//! End-to-end import → scan → promote → execute flows against a real SQLite
//! file, with the semantic service and the container runtime replaced.

use async_trait::async_trait;
use skillbox::scanner::{FindingCategory, SemanticFinding};
use skillbox::skills::{ExecutionRequest, InputBindings, SandboxRun};
use skillbox::{
    AnalyzerError, AuditSink, ContainerSandbox, ExecuteError, ExecutionOutcome, ExecutionRecord, ExecutionResponse,
    GovernanceLevel, ImportError, ImportItem, RegistryConfig, RegistryError, RiskLevel, Sandbox, SandboxConfig,
    SandboxError, ScanCache, ScannerConfig, SecurityScanner, SemanticAnalyzer, SemanticAssessment, SkillRegistry,
    SkillStore, StaticGovernance, TrustState,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

// ========== Test doubles ==========

/// Semantic service stand-in with a switchable answer
struct ScriptedAnalyzer {
    answer: Mutex<Option<RiskLevel>>,
    calls: AtomicUsize,
}

impl ScriptedAnalyzer {
    fn answering(risk: RiskLevel) -> Arc<Self> {
        Arc::new(Self {
            answer: Mutex::new(Some(risk)),
            calls: AtomicUsize::new(0),
        })
    }

    fn offline() -> Arc<Self> {
        Arc::new(Self {
            answer: Mutex::new(None),
            calls: AtomicUsize::new(0),
        })
    }

    fn come_online(&self, risk: RiskLevel) {
        *self.answer.lock().unwrap() = Some(risk);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SemanticAnalyzer for ScriptedAnalyzer {
    fn model_id(&self) -> &str {
        "scripted"
    }

    async fn assess(&self, _source: &str) -> Result<SemanticAssessment, AnalyzerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let answer = *self.answer.lock().unwrap();
        let category = match answer {
            None => return Err(AnalyzerError::Unavailable("connection refused".to_string())),
            Some(RiskLevel::Low) => return Ok(SemanticAssessment::from_findings(vec![])),
            Some(RiskLevel::High) => FindingCategory::DataExfiltration,
            Some(_) => FindingCategory::UnauthorizedAccess,
        };
        Ok(SemanticAssessment::from_findings(vec![SemanticFinding {
            category,
            explanation: "scripted finding".to_string(),
        }]))
    }
}

/// Wraps a sandbox and counts how often it is reached
struct CountingSandbox<S> {
    inner: S,
    calls: AtomicUsize,
}

impl<S> CountingSandbox<S> {
    fn new(inner: S) -> Arc<Self> {
        Arc::new(Self {
            inner,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<S: Sandbox> Sandbox for CountingSandbox<S> {
    async fn execute(&self, request: ExecutionRequest) -> Result<SandboxRun, SandboxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(request).await
    }

    fn active_environments(&self) -> usize {
        self.inner.active_environments()
    }
}

/// Always succeeds, echoing the bound inputs
struct EchoSandbox;

#[async_trait]
impl Sandbox for EchoSandbox {
    async fn execute(&self, request: ExecutionRequest) -> Result<SandboxRun, SandboxError> {
        Ok(SandboxRun {
            environment_id: format!("skillbox-{}", uuid::Uuid::new_v4()),
            exit_code: 0,
            stdout: serde_json::to_string(&request.inputs).unwrap(),
            stderr: String::new(),
            usage: Default::default(),
        })
    }

    fn active_environments(&self) -> usize {
        0
    }
}

#[derive(Default)]
struct CollectingAudit {
    records: Mutex<Vec<ExecutionRecord>>,
}

impl AuditSink for CollectingAudit {
    fn append(&self, record: &ExecutionRecord) {
        self.records.lock().unwrap().push(record.clone());
    }
}

// ========== Fixtures ==========

const BENIGN_CODE: &str = r#"
[skill]
name = "greeter"
description = "Greets someone"

[execution]
type = "script"
language = "python"
script = "print('hello ' + name)"
"#;

const SPAWNING_CODE: &str = r#"
[skill]
name = "pwn"

[execution]
type = "script"
language = "python"
script = "import subprocess\nsubprocess.Popen(['sh', '-c', 'id'])"
"#;

const INSTRUCTION: &str = "---\nname: translate\ndescription: Translates text\n---\nTranslate {{text}} into {{lang}}.";

fn create_test_registry(
    name: &str,
    analyzer: Arc<ScriptedAnalyzer>,
    sandbox: Arc<dyn Sandbox>,
) -> (SkillRegistry, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join(format!("{}.db", name));
    let store = SkillStore::open(&db_path).expect("Failed to create store");

    let scanner = SecurityScanner::new(analyzer, ScanCache::new(1000, 3600), ScannerConfig::default());
    let governance = StaticGovernance::default()
        .with_caller("viewer", GovernanceLevel::Restricted)
        .with_caller("operator", GovernanceLevel::Supervised)
        .with_caller("root", GovernanceLevel::Autonomous);

    let registry = SkillRegistry::new(store, Arc::new(scanner), sandbox).with_governance(Arc::new(governance));
    (registry, temp_dir)
}

// ========== Import ==========

#[tokio::test]
async fn test_process_spawn_is_critical_without_semantic_call() {
    let analyzer = ScriptedAnalyzer::answering(RiskLevel::Low);
    let (registry, _temp) = create_test_registry("spawn", analyzer.clone(), Arc::new(EchoSandbox));

    let report = registry.import(SPAWNING_CODE, "hub://pwn").await.unwrap();

    assert_eq!(report.risk_level, RiskLevel::Critical);
    assert_eq!(report.trust_state, TrustState::Untrusted);
    assert!(report.findings.iter().any(|f| f.contains("subprocess")));
    assert_eq!(analyzer.calls(), 0);
}

#[tokio::test]
async fn test_benign_low_risk_skill_becomes_active() {
    let analyzer = ScriptedAnalyzer::answering(RiskLevel::Low);
    let (registry, _temp) = create_test_registry("benign", analyzer.clone(), Arc::new(EchoSandbox));

    let report = registry.import(BENIGN_CODE, "hub://greeter").await.unwrap();

    assert_eq!(report.risk_level, RiskLevel::Low);
    assert_eq!(report.trust_state, TrustState::Active);
    assert_eq!(analyzer.calls(), 1);

    let skill = registry.get(&report.skill_id).unwrap().unwrap();
    assert_eq!(skill.name, "greeter");
    assert!(skill.kind.is_code());
    assert_eq!(skill.origin, "hub://greeter");
}

#[tokio::test]
async fn test_unreachable_semantic_service_imports_as_unknown() {
    let analyzer = ScriptedAnalyzer::offline();
    let (registry, _temp) = create_test_registry("offline", analyzer.clone(), Arc::new(EchoSandbox));

    let report = registry.import(BENIGN_CODE, "hub://greeter").await.unwrap();

    assert_eq!(report.risk_level, RiskLevel::Unknown);
    assert_eq!(report.trust_state, TrustState::Untrusted);
    assert_eq!(registry.list(Some(TrustState::Untrusted)).unwrap().len(), 1);
}

#[tokio::test]
async fn test_reimport_after_outage_rescans_unknown_skill() {
    let analyzer = ScriptedAnalyzer::offline();
    let (registry, _temp) = create_test_registry("rescan", analyzer.clone(), Arc::new(EchoSandbox));

    let first = registry.import(BENIGN_CODE, "hub").await.unwrap();
    assert_eq!(first.risk_level, RiskLevel::Unknown);
    assert_eq!(first.trust_state, TrustState::Untrusted);

    analyzer.come_online(RiskLevel::Low);
    let second = registry.import(BENIGN_CODE, "hub").await.unwrap();
    assert!(second.deduplicated);
    assert_eq!(second.skill_id, first.skill_id);
    assert_eq!(second.risk_level, RiskLevel::Low);
    assert_eq!(second.trust_state, TrustState::Active);
    assert_eq!(analyzer.calls(), 2);

    let transitions = registry.transitions(&first.skill_id).unwrap();
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].actor, "system");
    assert!(transitions[0].applied);
    assert_eq!(transitions[0].to_state, TrustState::Active);

    // Assessed now, so further imports neither rescan nor transition again
    let third = registry.import(BENIGN_CODE, "hub").await.unwrap();
    assert_eq!(third.risk_level, RiskLevel::Low);
    assert_eq!(analyzer.calls(), 2);
    assert_eq!(registry.transitions(&first.skill_id).unwrap().len(), 1);
}

#[tokio::test]
async fn test_rescan_above_low_keeps_skill_untrusted() {
    let analyzer = ScriptedAnalyzer::offline();
    let (registry, _temp) = create_test_registry("rescan_medium", analyzer.clone(), Arc::new(EchoSandbox));

    let first = registry.import(BENIGN_CODE, "hub").await.unwrap();
    analyzer.come_online(RiskLevel::Medium);
    let second = registry.import(BENIGN_CODE, "hub").await.unwrap();

    assert_eq!(second.skill_id, first.skill_id);
    assert_eq!(second.risk_level, RiskLevel::Medium);
    assert_eq!(second.trust_state, TrustState::Untrusted);
    assert!(registry.transitions(&first.skill_id).unwrap().is_empty());
}

#[tokio::test]
async fn test_same_content_is_scanned_once() {
    let analyzer = ScriptedAnalyzer::answering(RiskLevel::Medium);
    let (registry, _temp) = create_test_registry("dedupe", analyzer.clone(), Arc::new(EchoSandbox));

    let first = registry.import(BENIGN_CODE, "mirror-a").await.unwrap();
    let second = registry.import(BENIGN_CODE, "mirror-b").await.unwrap();

    assert_eq!(first.skill_id, second.skill_id);
    assert!(second.deduplicated);
    assert_eq!(analyzer.calls(), 1);
    assert_eq!(registry.list(None).unwrap().len(), 1);
}

#[tokio::test]
async fn test_batch_import_isolates_failures() {
    let analyzer = ScriptedAnalyzer::answering(RiskLevel::Low);
    let (registry, _temp) = create_test_registry("batch", analyzer, Arc::new(EchoSandbox));

    let items = vec![
        ImportItem {
            source: BENIGN_CODE.to_string(),
            origin: "a".to_string(),
        },
        ImportItem {
            source: "   ".to_string(),
            origin: "b".to_string(),
        },
        ImportItem {
            source: SPAWNING_CODE.to_string(),
            origin: "c".to_string(),
        },
        ImportItem {
            source: INSTRUCTION.to_string(),
            origin: "d".to_string(),
        },
    ];

    let summary = registry.import_batch(&items).await;

    assert_eq!(summary.imported, 3);
    assert_eq!(summary.failed, 1);
    assert!(matches!(summary.outcomes[1], Err(ImportError::Parse(_))));
    assert_eq!(summary.outcomes[2].as_ref().unwrap().risk_level, RiskLevel::Critical);
    assert_eq!(registry.list(None).unwrap().len(), 3);
}

// ========== Lifecycle ==========

#[tokio::test]
async fn test_promote_active_skill_is_noop() {
    let analyzer = ScriptedAnalyzer::answering(RiskLevel::Low);
    let (registry, _temp) = create_test_registry("noop", analyzer, Arc::new(EchoSandbox));
    let id = registry.import(BENIGN_CODE, "a").await.unwrap().skill_id;

    let before = registry.get(&id).unwrap().unwrap();
    let transitions_before = registry.transitions(&id).unwrap().len();
    std::thread::sleep(Duration::from_millis(5));

    assert_eq!(registry.promote(&id, "admin").unwrap(), TrustState::Active);

    let after = registry.get(&id).unwrap().unwrap();
    assert_eq!(after.updated_at, before.updated_at);
    assert_eq!(registry.transitions(&id).unwrap().len(), transitions_before);
}

#[tokio::test]
async fn test_manual_promotion_and_terminal_ban() {
    let analyzer = ScriptedAnalyzer::answering(RiskLevel::Medium);
    let (registry, _temp) = create_test_registry("lifecycle", analyzer, Arc::new(EchoSandbox));
    let id = registry.import(BENIGN_CODE, "a").await.unwrap().skill_id;

    assert_eq!(registry.promote(&id, "alice").unwrap(), TrustState::Active);
    assert_eq!(registry.ban(&id, "bob", "phoning home").unwrap(), TrustState::Banned);

    let err = registry.promote(&id, "alice").unwrap_err();
    assert!(matches!(err, RegistryError::InvalidTransition { from: TrustState::Banned, .. }));

    let transitions = registry.transitions(&id).unwrap();
    let summary: Vec<_> = transitions
        .iter()
        .map(|t| (t.from_state, t.to_state, t.applied, t.actor.as_str()))
        .collect();
    assert_eq!(
        summary,
        vec![
            (TrustState::Untrusted, TrustState::Active, true, "alice"),
            (TrustState::Active, TrustState::Banned, true, "bob"),
            (TrustState::Banned, TrustState::Active, false, "alice"),
        ]
    );
}

#[tokio::test]
async fn test_critical_skill_blocks_promotion() {
    let analyzer = ScriptedAnalyzer::answering(RiskLevel::Low);
    let (registry, _temp) = create_test_registry("critical", analyzer, Arc::new(EchoSandbox));
    let id = registry.import(SPAWNING_CODE, "a").await.unwrap().skill_id;

    assert!(matches!(registry.promote(&id, "admin"), Err(RegistryError::CriticalRisk(_))));
    assert_eq!(registry.get(&id).unwrap().unwrap().trust_state, TrustState::Untrusted);
}

#[tokio::test]
async fn test_unknown_skill_is_not_found() {
    let analyzer = ScriptedAnalyzer::answering(RiskLevel::Low);
    let (registry, _temp) = create_test_registry("missing", analyzer, Arc::new(EchoSandbox));

    assert!(matches!(registry.promote("nope", "admin"), Err(RegistryError::NotFound(_))));
    assert!(matches!(
        registry.execute("nope", "operator", InputBindings::new()).await,
        Err(ExecuteError::NotFound(_))
    ));
}

// ========== Execution ==========

#[tokio::test]
async fn test_banned_skill_never_reaches_sandbox() {
    let analyzer = ScriptedAnalyzer::answering(RiskLevel::Low);
    let sandbox = CountingSandbox::new(EchoSandbox);
    let audit = Arc::new(CollectingAudit::default());
    let (registry, _temp) = create_test_registry("banned", analyzer, sandbox.clone());
    let registry = registry.with_audit(audit.clone());

    let id = registry.import(BENIGN_CODE, "a").await.unwrap().skill_id;
    registry.ban(&id, "admin", "malicious").unwrap();

    let err = registry.execute(&id, "root", InputBindings::new()).await.unwrap_err();
    assert!(matches!(err, ExecuteError::Banned { .. }));
    assert_eq!(sandbox.calls(), 0);

    let records = registry.executions(&id).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, ExecutionOutcome::Denied);
    assert!(records[0].environment_id.is_none());
    assert_eq!(Some(records[0].id.as_str()), err.execution_id());
    assert_eq!(audit.records.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_restricted_caller_cannot_run_code() {
    let analyzer = ScriptedAnalyzer::answering(RiskLevel::Low);
    let sandbox = CountingSandbox::new(EchoSandbox);
    let (registry, _temp) = create_test_registry("governance", analyzer, sandbox.clone());
    let id = registry.import(BENIGN_CODE, "a").await.unwrap().skill_id;

    for caller in ["viewer", "stranger"] {
        let err = registry.execute(&id, caller, InputBindings::new()).await.unwrap_err();
        match err {
            ExecuteError::GovernanceDenied { required, actual, .. } => {
                assert_eq!(required, GovernanceLevel::Supervised);
                assert_eq!(actual, GovernanceLevel::Restricted);
            }
            other => panic!("expected governance denial, got {other:?}"),
        }
    }
    assert_eq!(sandbox.calls(), 0);

    let mut inputs = InputBindings::new();
    inputs.insert("name".to_string(), "Ada".to_string());
    let response = registry.execute(&id, "operator", inputs).await.unwrap();
    assert_eq!(response.outcome(), ExecutionOutcome::Success);
    assert!(response.record().stdout.contains("Ada"));
    assert_eq!(response.record().governance_level, GovernanceLevel::Supervised);
    assert_eq!(sandbox.calls(), 1);
}

#[tokio::test]
async fn test_untrusted_code_still_runs_contained() {
    let analyzer = ScriptedAnalyzer::offline();
    let sandbox = CountingSandbox::new(EchoSandbox);
    let (registry, _temp) = create_test_registry("untrusted", analyzer, sandbox.clone());
    let id = registry.import(BENIGN_CODE, "a").await.unwrap().skill_id;

    let response = registry.execute(&id, "operator", InputBindings::new()).await.unwrap();
    assert_eq!(response.outcome(), ExecutionOutcome::Success);
    assert!(response.record().environment_id.is_some());
}

#[tokio::test]
async fn test_instruction_skill_renders_without_sandbox() {
    let analyzer = ScriptedAnalyzer::answering(RiskLevel::Low);
    let sandbox = CountingSandbox::new(EchoSandbox);
    let (registry, _temp) = create_test_registry("instruction", analyzer, sandbox.clone());
    let id = registry.import(INSTRUCTION, "a").await.unwrap().skill_id;

    let mut inputs = InputBindings::new();
    inputs.insert("text".to_string(), "good morning".to_string());
    inputs.insert("tone".to_string(), "formal".to_string());

    // Instruction-only skills are open to the lowest tier
    let response = registry.execute(&id, "viewer", inputs).await.unwrap();
    match response {
        ExecutionResponse::Prompt { prompt, record } => {
            assert!(prompt.starts_with("Translate good morning into {{lang}}."));
            assert!(prompt.contains("- tone: formal"));
            assert!(record.environment_id.is_none());
            assert_eq!(record.outcome, ExecutionOutcome::Success);
        }
        other => panic!("expected a prompt, got {other:?}"),
    }
    assert_eq!(sandbox.calls(), 0);
}

#[tokio::test]
async fn test_invalid_input_names_are_rejected_before_any_environment() {
    let analyzer = ScriptedAnalyzer::answering(RiskLevel::Low);
    let sandbox = Arc::new(ContainerSandbox::new(SandboxConfig {
        runtime: "/nonexistent/skillbox-runtime".to_string(),
        ..Default::default()
    }));
    let (registry, _temp) = create_test_registry("inputs", analyzer, sandbox);
    let id = registry.import(BENIGN_CODE, "a").await.unwrap().skill_id;

    let mut inputs = InputBindings::new();
    inputs.insert("bad-name; rm".to_string(), "x".to_string());
    let err = registry.execute(&id, "operator", inputs).await.unwrap_err();

    assert!(matches!(err, ExecuteError::InvalidInput { .. }));
    let records = registry.executions(&id).unwrap();
    assert_eq!(records[0].outcome, ExecutionOutcome::Denied);
    assert!(records[0].environment_id.is_none());
}

#[tokio::test]
async fn test_missing_runtime_is_fault_not_guest_error() {
    let analyzer = ScriptedAnalyzer::answering(RiskLevel::Low);
    let sandbox = Arc::new(ContainerSandbox::new(SandboxConfig {
        runtime: "/nonexistent/skillbox-runtime".to_string(),
        ..Default::default()
    }));
    let (registry, _temp) = create_test_registry("fault", analyzer, sandbox);
    let id = registry.import(BENIGN_CODE, "a").await.unwrap().skill_id;

    let err = registry.execute(&id, "operator", InputBindings::new()).await.unwrap_err();
    assert!(matches!(err, ExecuteError::Infrastructure { .. }));

    let records = registry.executions(&id).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, ExecutionOutcome::Fault);
    assert_eq!(registry.active_environments(), 0);
}

// ========== Runtime-backed ==========

/// Runtime stand-in driven by `sh <script>`
#[cfg(unix)]
fn fake_runtime(dir: &std::path::Path, run_body: &str) -> SandboxConfig {
    let script = dir.join("runtime.sh");
    let body = format!(
        "echo \"$@\" >> '{log}'\n\
         case \"$1\" in\n\
           run) {run_body} ;;\n\
           inspect) echo false ;;\n\
           rm) exit 0 ;;\n\
         esac\n",
        log = dir.join("calls.log").display(),
        run_body = run_body,
    );
    std::fs::write(&script, body).unwrap();

    SandboxConfig {
        runtime: "sh".to_string(),
        runtime_args: vec![script.display().to_string()],
        ..Default::default()
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_timeout_is_recorded_and_environment_destroyed() {
    let runtime_dir = TempDir::new().unwrap();
    let pid_file = runtime_dir.path().join("guest.pid");
    let config = fake_runtime(
        runtime_dir.path(),
        &format!("echo $$ > '{}'; exec sleep 10", pid_file.display()),
    );
    let sandbox = Arc::new(ContainerSandbox::new(config));

    let analyzer = ScriptedAnalyzer::answering(RiskLevel::Low);
    let (registry, _temp) = create_test_registry("timeout", analyzer, sandbox.clone());
    let registry = registry.with_config(RegistryConfig {
        exec_timeout: Duration::from_secs(2),
        ..Default::default()
    });
    let id = registry.import(BENIGN_CODE, "a").await.unwrap().skill_id;

    let response = registry.execute(&id, "operator", InputBindings::new()).await.unwrap();
    assert_eq!(response.outcome(), ExecutionOutcome::Timeout);

    let environment_id = response.record().environment_id.clone().unwrap();
    let calls = std::fs::read_to_string(runtime_dir.path().join("calls.log")).unwrap();
    assert!(calls.contains(&format!("rm --force {}", environment_id)));
    assert_eq!(sandbox.active_environments(), 0);

    let pid = std::fs::read_to_string(&pid_file).unwrap();
    let alive = std::process::Command::new("kill")
        .args(["-0", pid.trim()])
        .status()
        .unwrap()
        .success();
    assert!(!alive, "guest process survived the timeout");

    let records = registry.executions(&id).unwrap();
    assert_eq!(records[0].outcome, ExecutionOutcome::Timeout);
    assert!(records[0].usage.wall_time_ms >= 2000);
}

#[cfg(unix)]
#[tokio::test]
async fn test_environment_count_returns_to_baseline() {
    let runtime_dir = TempDir::new().unwrap();
    let config = fake_runtime(runtime_dir.path(), "cat > /dev/null; echo ok; exit 0");
    let sandbox = Arc::new(ContainerSandbox::new(config));

    let analyzer = ScriptedAnalyzer::answering(RiskLevel::Low);
    let (registry, _temp) = create_test_registry("baseline", analyzer, sandbox.clone());
    let registry = Arc::new(registry);
    let id = registry.import(BENIGN_CODE, "a").await.unwrap().skill_id;
    let baseline = registry.active_environments();

    let tasks: Vec<_> = (0..5)
        .map(|_| {
            let registry = registry.clone();
            let id = id.clone();
            tokio::spawn(async move { registry.execute(&id, "operator", InputBindings::new()).await })
        })
        .collect();

    let mut environments = Vec::new();
    for task in tasks {
        let response = task.await.unwrap().unwrap();
        assert_eq!(response.outcome(), ExecutionOutcome::Success);
        assert_eq!(response.record().stdout.trim(), "ok");
        environments.push(response.record().environment_id.clone().unwrap());
    }

    assert_eq!(registry.active_environments(), baseline);
    environments.sort();
    environments.dedup();
    assert_eq!(environments.len(), 5, "environment ids must be unique");
    assert_eq!(registry.executions(&id).unwrap().len(), 5);
}
