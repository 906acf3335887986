//! Skill Store
//!
//! SQLite persistence for skills, execution records and trust transitions.
//! Owned exclusively by the registry; timestamps are stored as Unix millis.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

use super::types::{
    ExecutionOutcome, ExecutionRecord, ResourceUsage, RiskLevel, Skill, SkillKind, SkillSummary, TransitionRecord,
    TrustState,
};
use crate::governance::GovernanceLevel;

const SKILL_COLUMNS: &str = "id, name, description, kind, source, fingerprint, trust_state, risk_level, \
                             findings, origin, created_at, updated_at";

/// SQLite-backed registry storage
pub struct SkillStore {
    conn: Connection,
}

impl SkillStore {
    /// Open or create the registry database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating registry directory {}", parent.display()))?;
        }

        let conn = Connection::open(path).with_context(|| format!("opening registry {}", path.display()))?;
        let store = Self { conn };
        store.init_schema()?;

        info!("Skill registry opened: {}", path.display());
        Ok(store)
    }

    /// Throwaway database, used by tests and dry runs
    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS skills (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                kind TEXT NOT NULL,
                source TEXT NOT NULL,
                fingerprint TEXT NOT NULL UNIQUE,
                trust_state TEXT NOT NULL CHECK(trust_state IN ('untrusted', 'active', 'banned')),
                risk_level TEXT NOT NULL,
                findings TEXT NOT NULL DEFAULT '[]',
                origin TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_skills_state ON skills(trust_state, created_at);

            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                skill_id TEXT NOT NULL REFERENCES skills(id),
                caller_id TEXT NOT NULL,
                governance_level TEXT NOT NULL,
                environment_id TEXT,
                started_at INTEGER NOT NULL,
                finished_at INTEGER NOT NULL,
                outcome TEXT NOT NULL,
                exit_code INTEGER,
                stdout TEXT NOT NULL DEFAULT '',
                stderr TEXT NOT NULL DEFAULT '',
                usage TEXT NOT NULL DEFAULT '{}'
            );

            CREATE INDEX IF NOT EXISTS idx_executions_skill ON executions(skill_id, started_at);

            CREATE TABLE IF NOT EXISTS transitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                skill_id TEXT NOT NULL REFERENCES skills(id),
                from_state TEXT NOT NULL,
                to_state TEXT NOT NULL,
                actor TEXT NOT NULL,
                reason TEXT NOT NULL DEFAULT '',
                applied INTEGER NOT NULL,
                at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_transitions_skill ON transitions(skill_id, id);
            "#,
        )?;
        Ok(())
    }

    /// Insert a skill unless its fingerprint is already stored.
    ///
    /// Returns false when an existing row with the same content won.
    pub fn insert_skill(&self, skill: &Skill) -> Result<bool> {
        let inserted = self.conn.execute(
            "INSERT INTO skills (id, name, description, kind, source, fingerprint, trust_state, risk_level,
                                 findings, origin, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(fingerprint) DO NOTHING",
            params![
                skill.id,
                skill.name,
                skill.description,
                skill.kind.encode(),
                skill.source,
                skill.fingerprint,
                skill.trust_state.as_str(),
                skill.risk_level.as_str(),
                serde_json::to_string(&skill.findings)?,
                skill.origin,
                skill.created_at.timestamp_millis(),
                skill.updated_at.timestamp_millis(),
            ],
        )?;
        Ok(inserted == 1)
    }

    pub fn get(&self, skill_id: &str) -> Result<Option<Skill>> {
        let sql = format!("SELECT {} FROM skills WHERE id = ?1", SKILL_COLUMNS);
        let skill = self
            .conn
            .query_row(&sql, params![skill_id], skill_from_row)
            .optional()?;
        Ok(skill)
    }

    pub fn find_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Skill>> {
        let sql = format!("SELECT {} FROM skills WHERE fingerprint = ?1", SKILL_COLUMNS);
        let skill = self
            .conn
            .query_row(&sql, params![fingerprint], skill_from_row)
            .optional()?;
        Ok(skill)
    }

    /// Skills in creation order, optionally filtered by trust state
    pub fn list(&self, state: Option<TrustState>) -> Result<Vec<SkillSummary>> {
        let sql = format!(
            "SELECT {} FROM skills WHERE (?1 IS NULL OR trust_state = ?1) ORDER BY created_at, rowid",
            SKILL_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![state.map(|s| s.as_str())], skill_from_row)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?.summary());
        }
        Ok(out)
    }

    /// Conditional state change: applies only if the skill is still in `from`
    pub fn update_trust(&self, skill_id: &str, from: TrustState, to: TrustState, at: DateTime<Utc>) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE skills SET trust_state = ?1, updated_at = ?2 WHERE id = ?3 AND trust_state = ?4",
            params![to.as_str(), at.timestamp_millis(), skill_id, from.as_str()],
        )?;
        Ok(changed == 1)
    }

    /// Replace a scan verdict, only while the stored risk is still `from`
    pub fn update_risk(
        &self,
        skill_id: &str,
        from: RiskLevel,
        to: RiskLevel,
        findings: &[String],
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE skills SET risk_level = ?1, findings = ?2, updated_at = ?3 WHERE id = ?4 AND risk_level = ?5",
            params![
                to.as_str(),
                serde_json::to_string(findings)?,
                at.timestamp_millis(),
                skill_id,
                from.as_str()
            ],
        )?;
        Ok(changed == 1)
    }

    pub fn insert_transition(&self, record: &TransitionRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO transitions (skill_id, from_state, to_state, actor, reason, applied, at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.skill_id,
                record.from_state.as_str(),
                record.to_state.as_str(),
                record.actor,
                record.reason,
                record.applied,
                record.at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn list_transitions(&self, skill_id: &str) -> Result<Vec<TransitionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT skill_id, from_state, to_state, actor, reason, applied, at
             FROM transitions WHERE skill_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![skill_id], |row| {
            Ok(TransitionRecord {
                skill_id: row.get(0)?,
                from_state: parse_column(row, 1)?,
                to_state: parse_column(row, 2)?,
                actor: row.get(3)?,
                reason: row.get(4)?,
                applied: row.get(5)?,
                at: millis(row.get(6)?),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn insert_execution(&self, record: &ExecutionRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO executions (id, skill_id, caller_id, governance_level, environment_id, started_at,
                                     finished_at, outcome, exit_code, stdout, stderr, usage)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.id,
                record.skill_id,
                record.caller_id,
                record.governance_level.as_str(),
                record.environment_id,
                record.started_at.timestamp_millis(),
                record.finished_at.timestamp_millis(),
                record.outcome.as_str(),
                record.exit_code,
                record.stdout,
                record.stderr,
                serde_json::to_string(&record.usage)?,
            ],
        )?;
        Ok(())
    }

    pub fn list_executions(&self, skill_id: &str) -> Result<Vec<ExecutionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, skill_id, caller_id, governance_level, environment_id, started_at, finished_at,
                    outcome, exit_code, stdout, stderr, usage
             FROM executions WHERE skill_id = ?1 ORDER BY started_at, rowid",
        )?;
        let rows = stmt.query_map(params![skill_id], |row| {
            let governance_level: GovernanceLevel = parse_column(row, 3)?;
            let outcome: ExecutionOutcome = parse_column(row, 7)?;
            let usage: ResourceUsage = json_column(row, 11)?;
            Ok(ExecutionRecord {
                id: row.get(0)?,
                skill_id: row.get(1)?,
                caller_id: row.get(2)?,
                governance_level,
                environment_id: row.get(4)?,
                started_at: millis(row.get(5)?),
                finished_at: millis(row.get(6)?),
                outcome,
                exit_code: row.get(8)?,
                stdout: row.get(9)?,
                stderr: row.get(10)?,
                usage,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn skill_from_row(row: &Row<'_>) -> rusqlite::Result<Skill> {
    let kind_raw: String = row.get(3)?;
    let kind = SkillKind::decode(&kind_raw).map_err(|e| conversion_error(3, e))?;
    let trust_state: TrustState = parse_column(row, 6)?;
    let risk_level: RiskLevel = parse_column(row, 7)?;
    let findings: Vec<String> = json_column(row, 8)?;

    Ok(Skill {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        kind,
        source: row.get(4)?,
        fingerprint: row.get(5)?,
        trust_state,
        risk_level,
        findings,
        origin: row.get(9)?,
        created_at: millis(row.get(10)?),
        updated_at: millis(row.get(11)?),
    })
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skills::types::Language;

    fn skill(id: &str, fingerprint: &str, state: TrustState) -> Skill {
        let now = DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap();
        Skill {
            id: id.into(),
            name: format!("skill_{id}"),
            description: "test".into(),
            kind: SkillKind::ExecutableCode {
                language: Language::Python,
            },
            source: "print(1)".into(),
            fingerprint: fingerprint.into(),
            trust_state: state,
            risk_level: RiskLevel::Medium,
            findings: vec!["resource_abuse: loop".into()],
            origin: "test".into(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_insert_and_get_round_trip() {
        let store = SkillStore::open_in_memory().unwrap();
        let original = skill("a", "fp-a", TrustState::Untrusted);
        assert!(store.insert_skill(&original).unwrap());

        let loaded = store.get("a").unwrap().unwrap();
        assert_eq!(loaded.kind, original.kind);
        assert_eq!(loaded.findings, original.findings);
        assert_eq!(loaded.created_at, original.created_at);
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_fingerprint_is_not_inserted() {
        let store = SkillStore::open_in_memory().unwrap();
        assert!(store.insert_skill(&skill("a", "fp", TrustState::Untrusted)).unwrap());
        assert!(!store.insert_skill(&skill("b", "fp", TrustState::Active)).unwrap());

        assert_eq!(store.find_by_fingerprint("fp").unwrap().unwrap().id, "a");
        assert_eq!(store.list(None).unwrap().len(), 1);
    }

    #[test]
    fn test_conditional_update() {
        let store = SkillStore::open_in_memory().unwrap();
        store.insert_skill(&skill("a", "fp", TrustState::Untrusted)).unwrap();

        let now = Utc::now();
        assert!(store.update_trust("a", TrustState::Untrusted, TrustState::Active, now).unwrap());
        // Stale expectation loses
        assert!(!store.update_trust("a", TrustState::Untrusted, TrustState::Banned, now).unwrap());
        assert_eq!(store.get("a").unwrap().unwrap().trust_state, TrustState::Active);
    }

    #[test]
    fn test_risk_update_is_conditional() {
        let store = SkillStore::open_in_memory().unwrap();
        let mut unscanned = skill("a", "fp-a", TrustState::Untrusted);
        unscanned.risk_level = RiskLevel::Unknown;
        store.insert_skill(&unscanned).unwrap();

        let now = Utc::now();
        let findings = vec!["benign: prints a greeting".to_string()];
        assert!(store
            .update_risk("a", RiskLevel::Unknown, RiskLevel::Low, &findings, now)
            .unwrap());
        // Already rescanned, a second writer loses
        assert!(!store
            .update_risk("a", RiskLevel::Unknown, RiskLevel::High, &[], now)
            .unwrap());

        let loaded = store.get("a").unwrap().unwrap();
        assert_eq!(loaded.risk_level, RiskLevel::Low);
        assert_eq!(loaded.findings, findings);
    }

    #[test]
    fn test_list_filters_by_state() {
        let store = SkillStore::open_in_memory().unwrap();
        store.insert_skill(&skill("a", "fp-a", TrustState::Untrusted)).unwrap();
        store.insert_skill(&skill("b", "fp-b", TrustState::Active)).unwrap();
        store.insert_skill(&skill("c", "fp-c", TrustState::Active)).unwrap();

        let active = store.list(Some(TrustState::Active)).unwrap();
        assert_eq!(active.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), vec!["b", "c"]);
        assert_eq!(store.list(None).unwrap().len(), 3);
    }

    #[test]
    fn test_execution_and_transition_records() {
        let store = SkillStore::open_in_memory().unwrap();
        store.insert_skill(&skill("a", "fp", TrustState::Active)).unwrap();

        let now = Utc::now();
        store
            .insert_execution(&ExecutionRecord {
                id: "e1".into(),
                skill_id: "a".into(),
                caller_id: "bob".into(),
                governance_level: GovernanceLevel::Supervised,
                environment_id: Some("skillbox-123".into()),
                started_at: now,
                finished_at: now,
                outcome: ExecutionOutcome::Timeout,
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                usage: ResourceUsage {
                    wall_time_ms: 2000,
                    memory_limit_mb: 256,
                    ..Default::default()
                },
            })
            .unwrap();
        store
            .insert_transition(&TransitionRecord {
                skill_id: "a".into(),
                from_state: TrustState::Active,
                to_state: TrustState::Banned,
                actor: "admin".into(),
                reason: "abuse".into(),
                applied: true,
                at: now,
            })
            .unwrap();

        let executions = store.list_executions("a").unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].outcome, ExecutionOutcome::Timeout);
        assert_eq!(executions[0].usage.wall_time_ms, 2000);
        assert_eq!(executions[0].environment_id.as_deref(), Some("skillbox-123"));

        let transitions = store.list_transitions("a").unwrap();
        assert_eq!(transitions.len(), 1);
        assert!(transitions[0].applied);
        assert_eq!(transitions[0].to_state, TrustState::Banned);
    }

    #[test]
    fn test_open_creates_parent_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("registry.db");
        let store = SkillStore::open(&path).unwrap();
        store.insert_skill(&skill("a", "fp", TrustState::Untrusted)).unwrap();
        drop(store);

        let reopened = SkillStore::open(&path).unwrap();
        assert!(reopened.get("a").unwrap().is_some());
    }
}
