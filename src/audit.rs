//! Execution Audit Sink
//!
//! Write-only destination for execution records. Appends are fire-and-forget:
//! a sink must never fail the execution it is describing.

use tracing::{info, warn};

use crate::skills::types::{ExecutionOutcome, ExecutionRecord};

/// External audit logging collaborator
pub trait AuditSink: Send + Sync {
    fn append(&self, record: &ExecutionRecord);
}

/// Emits one structured `tracing` event per execution record
#[derive(Debug, Default, Clone)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn append(&self, record: &ExecutionRecord) {
        let duration_ms = (record.finished_at - record.started_at).num_milliseconds();
        match record.outcome {
            ExecutionOutcome::Success | ExecutionOutcome::Error | ExecutionOutcome::Timeout => info!(
                target: "skillbox::audit",
                execution_id = %record.id,
                skill_id = %record.skill_id,
                caller_id = %record.caller_id,
                governance = %record.governance_level,
                environment_id = record.environment_id.as_deref().unwrap_or("-"),
                outcome = %record.outcome,
                exit_code = ?record.exit_code,
                duration_ms,
                oom_killed = record.usage.oom_killed,
                truncated = record.usage.output_truncated,
                "Skill execution"
            ),
            ExecutionOutcome::Denied | ExecutionOutcome::Fault => warn!(
                target: "skillbox::audit",
                execution_id = %record.id,
                skill_id = %record.skill_id,
                caller_id = %record.caller_id,
                governance = %record.governance_level,
                outcome = %record.outcome,
                detail = %record.stderr,
                "Skill execution not completed"
            ),
        }
    }
}

/// Sink that discards everything
#[derive(Debug, Default, Clone)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn append(&self, _record: &ExecutionRecord) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governance::GovernanceLevel;
    use crate::skills::types::ResourceUsage;
    use chrono::Utc;

    fn record(outcome: ExecutionOutcome) -> ExecutionRecord {
        let now = Utc::now();
        ExecutionRecord {
            id: "e1".into(),
            skill_id: "s1".into(),
            caller_id: "alice".into(),
            governance_level: GovernanceLevel::Supervised,
            environment_id: None,
            started_at: now,
            finished_at: now,
            outcome,
            exit_code: None,
            stdout: String::new(),
            stderr: "denied".into(),
            usage: ResourceUsage::default(),
        }
    }

    #[test]
    fn test_sinks_accept_every_outcome() {
        let sinks: Vec<Box<dyn AuditSink>> = vec![Box::new(TracingAuditSink), Box::new(NullAuditSink)];
        for sink in &sinks {
            for outcome in [
                ExecutionOutcome::Success,
                ExecutionOutcome::Error,
                ExecutionOutcome::Timeout,
                ExecutionOutcome::Denied,
                ExecutionOutcome::Fault,
            ] {
                sink.append(&record(outcome));
            }
        }
    }
}
