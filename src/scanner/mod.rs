//! Two-Tier Security Scanner
//!
//! # Architecture
//!
//! ```text
//! scan(source) ──► fingerprint ──► ScanCache ──hit──► ScanResult
//!                                      │ miss (computed once per key)
//!                                      ▼
//!                               Static signatures ──match──► Critical
//!                                      │ clean
//!                                      ▼
//!                               Semantic analyzer ──ok──► Low/Medium/High
//!                                      │ error / timeout
//!                                      ▼
//!                               Unknown (fail-open, not cached)
//! ```

pub mod semantic;
pub mod signatures;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::{ScanCache, ScanKey};
use crate::skills::types::RiskLevel;

pub use semantic::{
    AnalyzerError, ClaudeAnalyzer, FindingCategory, SemanticAnalyzer, SemanticAssessment, SemanticFinding,
};
pub use signatures::{SignatureClass, SignatureMatch};

/// Which tiers produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMethod {
    /// Static tier matched; semantic tier skipped
    Static,
    /// Semantic tier only (static tier disabled)
    Semantic,
    /// Static tier clean, semantic tier assessed
    Both,
    /// Semantic tier unavailable
    Failed,
}

impl ScanMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanMethod::Static => "static",
            ScanMethod::Semantic => "semantic",
            ScanMethod::Both => "both",
            ScanMethod::Failed => "failed",
        }
    }
}

/// Outcome of the tiers, before it becomes a [`ScanResult`].
///
/// Callers must handle the degraded case explicitly.
#[derive(Debug, Clone)]
pub enum ScanVerdict {
    CriticalMatch(Vec<SignatureMatch>),
    RiskAssessed(SemanticAssessment),
    ScanUnavailable(String),
}

/// Cached scan result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub fingerprint: String,
    pub risk_level: RiskLevel,
    /// Signature names or semantic explanations
    pub findings: Vec<String>,
    pub method: ScanMethod,
    pub scanned_at: DateTime<Utc>,
}

impl ScanResult {
    fn from_verdict(fingerprint: &str, verdict: ScanVerdict, static_ran: bool) -> Self {
        let (risk_level, findings, method) = match verdict {
            ScanVerdict::CriticalMatch(matches) => (
                RiskLevel::Critical,
                matches.iter().map(SignatureMatch::describe).collect(),
                ScanMethod::Static,
            ),
            ScanVerdict::RiskAssessed(assessment) => (
                assessment.risk_level,
                assessment.findings.iter().map(SemanticFinding::describe).collect(),
                if static_ran { ScanMethod::Both } else { ScanMethod::Semantic },
            ),
            ScanVerdict::ScanUnavailable(reason) => (
                RiskLevel::Unknown,
                vec![format!("semantic scan unavailable: {}", reason)],
                ScanMethod::Failed,
            ),
        };

        Self {
            fingerprint: fingerprint.to_string(),
            risk_level,
            findings,
            method,
            scanned_at: Utc::now(),
        }
    }
}

/// SHA-256 hex fingerprint of skill content
pub fn fingerprint(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hex::encode(hasher.finalize())
}

/// Scanner configuration
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Run the signature tier first
    pub static_tier: bool,
    /// Budget for one semantic call
    pub semantic_timeout: Duration,
    /// Sources longer than this are truncated before the semantic call
    pub max_semantic_chars: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            static_tier: true,
            semantic_timeout: Duration::from_secs(30),
            max_semantic_chars: 48_000,
        }
    }
}

/// Scanner statistics
#[derive(Debug, Clone, Default)]
pub struct ScannerStats {
    pub static_matches: u64,
    pub semantic_calls: u64,
    pub semantic_failures: u64,
}

/// Static + semantic scanner with content-addressed caching
pub struct SecurityScanner {
    analyzer: Arc<dyn SemanticAnalyzer>,
    cache: ScanCache,
    config: ScannerConfig,
    static_matches: AtomicU64,
    semantic_calls: AtomicU64,
    semantic_failures: AtomicU64,
}

impl SecurityScanner {
    /// The cache is injected so it can be shared or inspected
    pub fn new(analyzer: Arc<dyn SemanticAnalyzer>, cache: ScanCache, config: ScannerConfig) -> Self {
        Self {
            analyzer,
            cache,
            config,
            static_matches: AtomicU64::new(0),
            semantic_calls: AtomicU64::new(0),
            semantic_failures: AtomicU64::new(0),
        }
    }

    pub fn cache(&self) -> &ScanCache {
        &self.cache
    }

    pub fn stats(&self) -> ScannerStats {
        ScannerStats {
            static_matches: self.static_matches.load(Ordering::Relaxed),
            semantic_calls: self.semantic_calls.load(Ordering::Relaxed),
            semantic_failures: self.semantic_failures.load(Ordering::Relaxed),
        }
    }

    /// Scan skill content, consulting the cache first.
    ///
    /// Never fails: an unreachable semantic tier yields risk `Unknown`.
    pub async fn scan(&self, skill_id: &str, source: &str) -> ScanResult {
        let fingerprint = fingerprint(source);
        let key = ScanKey::new(&fingerprint, self.analyzer.model_id());

        let computed = self
            .cache
            .get_or_compute(key, async {
                match self.evaluate(skill_id, source).await {
                    ScanVerdict::ScanUnavailable(reason) => Err(reason),
                    verdict => Ok(ScanResult::from_verdict(&fingerprint, verdict, self.config.static_tier)),
                }
            })
            .await;

        match computed {
            Ok((result, cached)) => {
                debug!(
                    skill_id,
                    fingerprint = %&fingerprint[..16],
                    risk = %result.risk_level,
                    cached,
                    "Scan complete"
                );
                result
            }
            Err(reason) => {
                warn!(
                    skill_id,
                    fingerprint = %&fingerprint[..16],
                    "Semantic tier unavailable, failing open with risk=unknown: {}",
                    reason
                );
                ScanResult::from_verdict(
                    &fingerprint,
                    ScanVerdict::ScanUnavailable(reason.to_string()),
                    self.config.static_tier,
                )
            }
        }
    }

    /// Run both tiers without touching the cache
    pub async fn evaluate(&self, skill_id: &str, source: &str) -> ScanVerdict {
        if self.config.static_tier {
            let matches = signatures::scan(source);
            if !matches.is_empty() {
                self.static_matches.fetch_add(1, Ordering::Relaxed);
                info!(
                    skill_id,
                    signatures = ?matches.iter().map(|m| m.name).collect::<Vec<_>>(),
                    "Static signature match, risk=critical"
                );
                return ScanVerdict::CriticalMatch(matches);
            }
        }

        self.semantic_calls.fetch_add(1, Ordering::Relaxed);
        let excerpt = truncate_chars(source, self.config.max_semantic_chars);
        let outcome = tokio::time::timeout(self.config.semantic_timeout, self.analyzer.assess(excerpt))
            .await
            .unwrap_or(Err(AnalyzerError::Timeout(self.config.semantic_timeout)));

        match outcome {
            Ok(assessment) => {
                info!(
                    skill_id,
                    model = self.analyzer.model_id(),
                    risk = %assessment.risk_level,
                    findings = assessment.findings.len(),
                    "Semantic assessment complete"
                );
                ScanVerdict::RiskAssessed(assessment)
            }
            Err(e) => {
                self.semantic_failures.fetch_add(1, Ordering::Relaxed);
                ScanVerdict::ScanUnavailable(e.to_string())
            }
        }
    }
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Analyzer double returning a fixed answer and counting calls
    pub struct FixedAnalyzer {
        pub calls: AtomicUsize,
        answer: Option<RiskLevel>,
        delay: Duration,
    }

    impl FixedAnalyzer {
        pub fn returning(risk: RiskLevel) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                answer: Some(risk),
                delay: Duration::ZERO,
            }
        }

        pub fn unreachable() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                answer: None,
                delay: Duration::ZERO,
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SemanticAnalyzer for FixedAnalyzer {
        fn model_id(&self) -> &str {
            "fixed-test-model"
        }

        async fn assess(&self, _source: &str) -> Result<SemanticAssessment, AnalyzerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match self.answer {
                Some(RiskLevel::Low) => Ok(SemanticAssessment::from_findings(vec![])),
                Some(RiskLevel::High) => Ok(SemanticAssessment::from_findings(vec![SemanticFinding {
                    category: FindingCategory::DataExfiltration,
                    explanation: "sends data out".to_string(),
                }])),
                Some(_) => Ok(SemanticAssessment::from_findings(vec![SemanticFinding {
                    category: FindingCategory::ResourceAbuse,
                    explanation: "unbounded loop".to_string(),
                }])),
                None => Err(AnalyzerError::Unavailable("connection refused".to_string())),
            }
        }
    }
}
