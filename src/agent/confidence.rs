//! Confidence scoring for prospective actions.
//!
//! Scoring is a pure function of the action and the strategy memory
//! contents: no randomness, no clock.

use serde::{Deserialize, Serialize};

use super::strategy_memory::StrategyMemory;
use crate::actions::{ActionKind, StepAction};

/// Starting score before any factor applies.
pub const BASELINE_SCORE: i32 = 50;

/// Largest bonus a memory match can add.
pub const MEMORY_MAX_BONUS: f64 = 40.0;

/// Memory matches at or below this success rate are ignored.
pub const MEMORY_MIN_SUCCESS_RATE: f64 = 0.7;

pub const WELL_KNOWN_BONUS: i32 = 20;

pub const GENERATIVE_PENALTY: i32 = -15;

/// File names that exist in most projects or can be recreated with a
/// sensible default.
pub const WELL_KNOWN_FILES: &[&str] = &[
    "Cargo.toml",
    "package.json",
    "README.md",
    "tsconfig.json",
    ".gitignore",
    ".editorconfig",
    "pyproject.toml",
    "requirements.txt",
    "go.mod",
    "Makefile",
    "Dockerfile",
    ".env",
];

/// Whether `name` is a well-known project file.
pub fn is_well_known_file(name: &str) -> bool {
    WELL_KNOWN_FILES.iter().any(|known| known.eq_ignore_ascii_case(name))
}

/// Risk classification derived from a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// `>= 70` low, `40..=69` medium, `< 40` high.
    pub fn from_score(score: u8) -> Self {
        match score {
            70..=u8::MAX => RiskLevel::Low,
            40..=69 => RiskLevel::Medium,
            _ => RiskLevel::High,
        }
    }
}

/// One contribution to a score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfidenceFactor {
    pub label: String,
    pub delta: i32,
    pub rationale: String,
}

impl ConfidenceFactor {
    fn new(label: &str, delta: i32, rationale: impl Into<String>) -> Self {
        Self {
            label: label.to_string(),
            delta,
            rationale: rationale.into(),
        }
    }
}

/// A score with the factors that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfidenceBreakdown {
    pub score: u8,
    pub risk_level: RiskLevel,
    pub factors: Vec<ConfidenceFactor>,
    pub memory_backed: bool,
}

impl ConfidenceBreakdown {
    /// The baseline score with no other factor.
    pub fn baseline() -> Self {
        Self::from_factors(
            vec![ConfidenceFactor::new(
                "baseline",
                BASELINE_SCORE,
                "Starting score",
            )],
            false,
        )
    }

    fn from_factors(factors: Vec<ConfidenceFactor>, memory_backed: bool) -> Self {
        let raw: i32 = factors.iter().map(|f| f.delta).sum();
        let score = raw.clamp(0, 100) as u8;
        Self {
            score,
            risk_level: RiskLevel::from_score(score),
            factors,
            memory_backed,
        }
    }
}

/// Static heuristics plus memory lookups.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfidenceScorer;

impl ConfidenceScorer {
    /// Score an action.
    ///
    /// Factors apply in a fixed order: baseline, memory match, well-known
    /// resource, generative penalty.
    pub fn score(action: &StepAction, memory: &StrategyMemory) -> ConfidenceBreakdown {
        let mut factors = vec![ConfidenceFactor::new(
            "baseline",
            BASELINE_SCORE,
            "Starting score",
        )];
        let mut memory_backed = false;

        if let Some(record) = memory.lookup(action) {
            let rate = record.success_rate();
            if rate > MEMORY_MIN_SUCCESS_RATE {
                let delta = (MEMORY_MAX_BONUS * rate).round() as i32;
                factors.push(ConfidenceFactor::new(
                    "memory_match",
                    delta,
                    format!(
                        "{} of {} similar actions succeeded",
                        record.success_count, record.attempt_count
                    ),
                ));
                memory_backed = true;
            }
        }

        if matches!(
            action.kind,
            ActionKind::ReadResource | ActionKind::WriteResource
        ) {
            if let Some(name) = action.resource_file_name() {
                if is_well_known_file(&name) {
                    factors.push(ConfidenceFactor::new(
                        "well_known_resource",
                        WELL_KNOWN_BONUS,
                        format!("{} is a well-known project file", name),
                    ));
                }
            }
        }

        if action.kind.is_generative() {
            factors.push(ConfidenceFactor::new(
                "generative_action",
                GENERATIVE_PENALTY,
                "Generated content is harder to get right",
            ));
        }

        ConfidenceBreakdown::from_factors(factors, memory_backed)
    }
}
