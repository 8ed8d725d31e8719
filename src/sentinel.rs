//! Sentinel verification: deterministic vetoes plus LLM judgment.
//!
//! Verification is two-phase. Phase A (`check_veto`) is pure and
//! synchronous: a catalog of danger patterns is matched against the
//! added lines of the diff, and any hit fails the attempt immediately
//! with no judge call. Phase B sends the diff plus project context to
//! the judge model and parses a strict-JSON verdict; malformed judge
//! output degrades to a conservative failing verdict instead of
//! throwing.
//!
//! Each verdict carries a locally computed merkle root over the diff
//! and the verdict body, so a replayed audit can detect tampering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

use crate::providers::{ChatMessage, LlmClient};
use crate::task::{MidnightTask, TaskId};
use crate::{mlog_debug, mlog_warn, Result};

/// Diff bytes per merkle leaf.
const MERKLE_CHUNK: usize = 1024;

/// Unique identifier for a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VerdictId(pub Uuid);

impl VerdictId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for VerdictId {
    fn default() -> Self {
        Self::new()
    }
}

/// How the diff maps onto the task's plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Traceability {
    /// Planned items the diff addresses.
    #[serde(default, alias = "mapped")]
    pub mapped: Vec<String>,
    /// Planned items the diff does not address.
    #[serde(default, alias = "missing")]
    pub missing: Vec<String>,
    /// Changes with no counterpart in the plan.
    #[serde(default, alias = "unplannedAdditions")]
    pub unplanned_additions: Vec<String>,
}

/// Structured audit trail attached to every verdict.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditLog {
    #[serde(default)]
    pub traceability: Traceability,
    #[serde(default, alias = "architecturalSins")]
    pub architectural_sins: Vec<String>,
    #[serde(default, alias = "slopPatternsDetected")]
    pub slop_patterns_detected: Vec<String>,
}

/// A Sentinel's structured judgment for one attempt.
///
/// Verdicts are append-only per task, ordered by attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentinelVerdict {
    pub id: VerdictId,
    pub task_id: TaskId,
    /// 0..=100.
    pub quality_score: u8,
    pub passed: bool,
    pub audit_log: AuditLog,
    /// Required whenever `passed` is false; injected into the next
    /// attempt's Actor context.
    pub correction_directive: Option<String>,
    /// Content-addressed over diff + verdict for tamper-evident replay.
    pub merkle_verification_hash: String,
    pub created_at: DateTime<Utc>,
}

/// One deterministic danger pattern.
///
/// The catalog is extensible policy: callers may add rules, and only
/// the two default rules are contractual.
#[derive(Debug, Clone)]
pub struct VetoRule {
    /// Exact message reported when the rule matches.
    pub message: String,
    pattern: regex::Regex,
}

impl VetoRule {
    pub fn new(message: impl Into<String>, pattern: &str) -> Result<Self> {
        let pattern = regex::Regex::new(pattern)
            .map_err(|e| crate::Error::Validation(format!("bad veto pattern: {}", e)))?;
        Ok(Self {
            message: message.into(),
            pattern,
        })
    }

    /// The confirmed default catalog: hardcoded secrets and
    /// unconditioned infinite loops.
    pub fn defaults() -> Vec<VetoRule> {
        vec![
            // Assignment of a quoted sk- token of 40+ characters.
            VetoRule::new(
                "VETO: Hardcoded secret or API key detected",
                r#"[:=]\s*["']sk-[A-Za-z0-9_-]{37,}["']"#,
            )
            .expect("default veto pattern"),
            VetoRule::new(
                "VETO: Potential infinite loop detected",
                r"while\s*\(\s*true\s*\)",
            )
            .expect("default veto pattern"),
        ]
    }
}

/// A deterministic safety violation found in a diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VetoViolation {
    pub message: String,
}

/// Context the judge sees alongside the diff.
pub struct ReviewContext<'a> {
    /// The project plan (idea.md).
    pub plan: &'a str,
    pub definition_of_done: &'a str,
    pub repo_map: Option<&'a str>,
    /// Prior attempts' verdicts, oldest first.
    pub previous: &'a [SentinelVerdict],
}

/// Independent verifier of Actor output.
pub struct SentinelAgent {
    llm: Arc<dyn LlmClient>,
    rules: Vec<VetoRule>,
    quality_threshold: u8,
}

impl SentinelAgent {
    pub fn new(llm: Arc<dyn LlmClient>, quality_threshold: u8) -> Self {
        Self {
            llm,
            rules: VetoRule::defaults(),
            quality_threshold,
        }
    }

    /// Extend the veto catalog.
    pub fn add_rule(&mut self, rule: VetoRule) {
        self.rules.push(rule);
    }

    pub fn quality_threshold(&self) -> u8 {
        self.quality_threshold
    }

    /// Phase A: pure, synchronous danger-pattern check over the added
    /// lines of a diff. First matching rule wins.
    pub fn check_veto(&self, diff: &str) -> Option<VetoViolation> {
        let added: String = diff
            .lines()
            .filter(|line| line.starts_with('+') && !line.starts_with("+++"))
            .collect::<Vec<_>>()
            .join("\n");

        for rule in &self.rules {
            if rule.pattern.is_match(&added) {
                return Some(VetoViolation {
                    message: rule.message.clone(),
                });
            }
        }
        None
    }

    /// Synthesize the failing verdict for a veto violation. The judge
    /// is never called: `quality_score` is 0 and the correction
    /// directive is the violation message.
    pub fn veto_verdict(
        &self,
        task: &MidnightTask,
        diff: &str,
        violation: &VetoViolation,
    ) -> SentinelVerdict {
        let mut verdict = SentinelVerdict {
            id: VerdictId::new(),
            task_id: task.id,
            quality_score: 0,
            passed: false,
            audit_log: AuditLog {
                slop_patterns_detected: vec![violation.message.clone()],
                ..AuditLog::default()
            },
            correction_directive: Some(violation.message.clone()),
            merkle_verification_hash: String::new(),
            created_at: Utc::now(),
        };
        verdict.merkle_verification_hash = merkle_hash(diff, &verdict);
        verdict
    }

    /// Failing verdict for an attempt whose Actor ran out of steps
    /// without declaring completion. Every consumed retry leaves a
    /// verdict, so a locked task always carries its full audit trail.
    pub fn incomplete_verdict(&self, task: &MidnightTask, diff: &str) -> SentinelVerdict {
        let mut verdict = SentinelVerdict {
            id: VerdictId::new(),
            task_id: task.id,
            quality_score: 0,
            passed: false,
            audit_log: AuditLog::default(),
            correction_directive: Some(
                "The attempt ran out of steps before finishing; split the work into \
                 smaller changes and complete the task"
                    .to_string(),
            ),
            merkle_verification_hash: String::new(),
            created_at: Utc::now(),
        };
        verdict.merkle_verification_hash = merkle_hash(diff, &verdict);
        verdict
    }

    /// Phase B: ask the judge model for a verdict. Only called when no
    /// veto matched. Malformed output degrades to a failing verdict.
    pub async fn judge(
        &self,
        task: &MidnightTask,
        diff: &str,
        ctx: &ReviewContext<'_>,
    ) -> Result<SentinelVerdict> {
        let messages = vec![
            ChatMessage::system(
                "You are Sentinel, an uncompromising code reviewer. Judge the diff \
                 strictly against the project plan and definition of done. Respond \
                 with a single JSON object and nothing else: {\"quality_score\": \
                 0-100, \"passed\": bool, \"audit_log\": {\"traceability\": \
                 {\"mapped\": [], \"missing\": [], \"unplannedAdditions\": []}, \
                 \"architecturalSins\": [], \"slopPatternsDetected\": []}, \
                 \"correction_directive\": string-or-null}. A correction_directive \
                 is required whenever passed is false.",
            ),
            ChatMessage::user(self.build_judge_prompt(task, diff, ctx)),
        ];

        let response = self.llm.chat(&messages).await?;
        let verdict = match parse_judge_output(&response.content, task.id, self.quality_threshold)
        {
            Some(verdict) => verdict,
            None => {
                mlog_warn!(
                    "Judge returned malformed output for task {}; degrading to fail",
                    task.id.short()
                );
                conservative_fail(task.id)
            }
        };

        let mut verdict = verdict;
        verdict.merkle_verification_hash = merkle_hash(diff, &verdict);
        mlog_debug!(
            "judge: task={} score={} passed={}",
            task.id.short(),
            verdict.quality_score,
            verdict.passed
        );
        Ok(verdict)
    }

    fn build_judge_prompt(
        &self,
        task: &MidnightTask,
        diff: &str,
        ctx: &ReviewContext<'_>,
    ) -> String {
        let mut prompt = String::new();
        prompt.push_str(&format!("TASK:\n{}\n", task.description));
        if !task.acceptance_criteria.is_empty() {
            prompt.push_str("\nACCEPTANCE CRITERIA:\n");
            for criterion in &task.acceptance_criteria {
                prompt.push_str(&format!("- {}\n", criterion));
            }
        }
        prompt.push_str(&format!("\nPROJECT PLAN:\n{}\n", ctx.plan));
        prompt.push_str(&format!(
            "\nDEFINITION OF DONE:\n{}\n",
            ctx.definition_of_done
        ));
        if let Some(map) = ctx.repo_map {
            prompt.push_str(&format!("\nREPOSITORY MAP:\n{}\n", map));
        }
        if !ctx.previous.is_empty() {
            prompt.push_str("\nPREVIOUS VERDICTS:\n");
            for (i, verdict) in ctx.previous.iter().enumerate() {
                prompt.push_str(&format!(
                    "- attempt {}: score {} {}{}\n",
                    i + 1,
                    verdict.quality_score,
                    if verdict.passed { "PASS" } else { "FAIL" },
                    verdict
                        .correction_directive
                        .as_deref()
                        .map(|d| format!(" ({})", d))
                        .unwrap_or_default()
                ));
            }
        }
        prompt.push_str(&format!("\nDIFF:\n{}\n", diff));
        prompt.push_str(&format!(
            "\nPass requires quality_score >= {}.",
            self.quality_threshold
        ));
        prompt
    }
}

/// Raw judge JSON. Tolerates both snake_case and the camelCase field
/// names seen in older judge prompts.
#[derive(Debug, Deserialize)]
struct RawJudgeOutput {
    #[serde(alias = "qualityScore")]
    quality_score: i64,
    passed: bool,
    #[serde(default, alias = "auditLog")]
    audit_log: AuditLog,
    #[serde(default, alias = "correctionDirective")]
    correction_directive: Option<String>,
    // The judge may echo a hash; it is advisory only and recomputed
    // locally.
    #[serde(default, alias = "merkleHash", alias = "merkle_verification_hash")]
    #[allow(dead_code)]
    merkle_hash: Option<String>,
}

/// Parse judge output, tolerating a fenced code block around the JSON.
/// Returns `None` when output is unusable; callers degrade to a
/// conservative failing verdict.
fn parse_judge_output(content: &str, task_id: TaskId, threshold: u8) -> Option<SentinelVerdict> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end < start {
        return None;
    }
    let raw: RawJudgeOutput = serde_json::from_str(&content[start..=end]).ok()?;

    let quality_score = raw.quality_score.clamp(0, 100) as u8;
    // The gate is deterministic regardless of what the judge claims.
    let passed = raw.passed && quality_score >= threshold;
    let correction_directive = if passed {
        None
    } else {
        Some(raw.correction_directive.unwrap_or_else(|| {
            format!(
                "Quality score {} is below the required threshold {}",
                quality_score, threshold
            )
        }))
    };

    Some(SentinelVerdict {
        id: VerdictId::new(),
        task_id,
        quality_score,
        passed,
        audit_log: raw.audit_log,
        correction_directive,
        merkle_verification_hash: String::new(),
        created_at: Utc::now(),
    })
}

fn conservative_fail(task_id: TaskId) -> SentinelVerdict {
    SentinelVerdict {
        id: VerdictId::new(),
        task_id,
        quality_score: 0,
        passed: false,
        audit_log: AuditLog::default(),
        correction_directive: Some(
            "Judge output was malformed; produce a smaller, clearer change and retry"
                .to_string(),
        ),
        merkle_verification_hash: String::new(),
        created_at: Utc::now(),
    }
}

/// Merkle root over diff chunks plus the verdict body.
///
/// Leaves are sha256 of fixed-size diff chunks and of the canonical
/// verdict JSON (with its hash field blanked); the tree folds pairwise,
/// carrying odd leaves up unchanged.
pub fn merkle_hash(diff: &str, verdict: &SentinelVerdict) -> String {
    let mut leaves: Vec<String> = diff
        .as_bytes()
        .chunks(MERKLE_CHUNK)
        .map(hash_bytes)
        .collect();

    let mut body = verdict.clone();
    body.merkle_verification_hash = String::new();
    let body_json = serde_json::to_string(&body).unwrap_or_default();
    leaves.push(hash_bytes(body_json.as_bytes()));

    while leaves.len() > 1 {
        let mut next = Vec::with_capacity(leaves.len() / 2 + 1);
        for pair in leaves.chunks(2) {
            if pair.len() == 2 {
                next.push(hash_bytes(format!("{}{}", pair[0], pair[1]).as_bytes()));
            } else {
                next.push(pair[0].clone());
            }
        }
        leaves = next;
    }
    leaves.into_iter().next().unwrap_or_default()
}

fn hash_bytes(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
