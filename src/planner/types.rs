//! Plan data types: increments, the immutable execution plan, and its summary.

use std::collections::BTreeMap;
use std::fmt::Write;

use serde::{Deserialize, Serialize};

use crate::errors::PlanError;
use crate::profile::WorkerProfile;

/// Architectural layer an increment works in. Declaration order is the
/// canonical feature order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Schema,
    Service,
    Presentation,
    Tests,
    Docs,
    General,
}

impl Layer {
    pub fn as_str(self) -> &'static str {
        match self {
            Layer::Schema => "schema",
            Layer::Service => "service",
            Layer::Presentation => "presentation",
            Layer::Tests => "tests",
            Layer::Docs => "docs",
            Layer::General => "general",
        }
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall shape of a request, decided by the first matching rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanShape {
    DocsOnly,
    TestOnly,
    DefectFix,
    Refactor,
    Feature,
    Generic,
}

impl std::fmt::Display for PlanShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PlanShape::DocsOnly => "documentation",
            PlanShape::TestOnly => "test-only",
            PlanShape::DefectFix => "defect fix",
            PlanShape::Refactor => "refactor",
            PlanShape::Feature => "feature",
            PlanShape::Generic => "generic",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncrementStatus {
    #[default]
    Pending,
    InProgress,
    Verifying,
    Completed,
    Failed,
}

impl std::fmt::Display for IncrementStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IncrementStatus::Pending => "pending",
            IncrementStatus::InProgress => "in_progress",
            IncrementStatus::Verifying => "verifying",
            IncrementStatus::Completed => "completed",
            IncrementStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A bounded unit of work within a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Increment {
    /// Position in the plan, starting at 0.
    pub index: usize,
    pub description: String,
    pub worker_profile: WorkerProfile,
    pub layer: Layer,
    /// Coarse estimate of the lines of output this increment produces.
    pub estimated_lines: u32,
    /// Indices of strictly earlier increments that must complete first.
    pub dependencies: Vec<usize>,
    pub status: IncrementStatus,
    pub retry_count: u32,
    pub verification_feedback: Option<String>,
}

impl Increment {
    pub fn new(
        index: usize,
        description: impl Into<String>,
        worker_profile: WorkerProfile,
        layer: Layer,
        estimated_lines: u32,
    ) -> Self {
        Self {
            index,
            description: description.into(),
            worker_profile,
            layer,
            estimated_lines,
            dependencies: Vec::new(),
            status: IncrementStatus::Pending,
            retry_count: 0,
            verification_feedback: None,
        }
    }

    pub fn depends_on(mut self, dependencies: impl IntoIterator<Item = usize>) -> Self {
        self.dependencies = dependencies.into_iter().collect();
        self
    }
}

/// Aggregate view of a plan. Always derived from the increments themselves,
/// never tracked separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub increment_count: usize,
    pub by_layer: BTreeMap<Layer, usize>,
    pub by_profile: BTreeMap<WorkerProfile, usize>,
    pub total_estimated_lines: u32,
}

impl PlanSummary {
    pub fn from_increments(increments: &[Increment]) -> Self {
        let mut by_layer = BTreeMap::new();
        let mut by_profile = BTreeMap::new();
        for inc in increments {
            *by_layer.entry(inc.layer).or_insert(0) += 1;
            *by_profile.entry(inc.worker_profile).or_insert(0) += 1;
        }
        Self {
            increment_count: increments.len(),
            by_layer,
            by_profile,
            total_estimated_lines: increments.iter().map(|i| i.estimated_lines).sum(),
        }
    }

    /// One-line description, e.g. `3 increments (~135 lines)`.
    pub fn headline(&self) -> String {
        let noun = if self.increment_count == 1 {
            "increment"
        } else {
            "increments"
        };
        format!(
            "{} {} (~{} lines)",
            self.increment_count, noun, self.total_estimated_lines
        )
    }
}

/// An ordered, validated list of increments. Immutable once built; the
/// pipeline works on its own copy of the increments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    request: String,
    shape: PlanShape,
    increments: Vec<Increment>,
}

impl ExecutionPlan {
    /// Build a plan, checking that increments are numbered by position and
    /// only depend on earlier ones.
    pub fn new(
        request: impl Into<String>,
        shape: PlanShape,
        increments: Vec<Increment>,
    ) -> Result<Self, PlanError> {
        for (position, inc) in increments.iter().enumerate() {
            if inc.index != position {
                return Err(PlanError::OutOfOrder {
                    position,
                    index: inc.index,
                });
            }
            if let Some(&dependency) = inc.dependencies.iter().find(|&&d| d >= inc.index) {
                return Err(PlanError::InvalidDependency {
                    index: inc.index,
                    dependency,
                });
            }
        }
        Ok(Self {
            request: request.into(),
            shape,
            increments,
        })
    }

    /// A plan of exactly one increment; always valid.
    pub fn single(request: impl Into<String>, shape: PlanShape, mut increment: Increment) -> Self {
        increment.index = 0;
        increment.dependencies.clear();
        Self {
            request: request.into(),
            shape,
            increments: vec![increment],
        }
    }

    pub fn request(&self) -> &str {
        &self.request
    }

    pub fn shape(&self) -> PlanShape {
        self.shape
    }

    pub fn increments(&self) -> &[Increment] {
        &self.increments
    }

    pub fn len(&self) -> usize {
        self.increments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.increments.is_empty()
    }

    pub fn summary(&self) -> PlanSummary {
        PlanSummary::from_increments(&self.increments)
    }

    /// Human-readable plan: headline, per-profile breakdown for larger plans,
    /// then one line per step.
    pub fn render(&self) -> String {
        let summary = self.summary();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Plan ({}): {} for \"{}\"",
            self.shape,
            summary.headline(),
            self.request.trim()
        );

        if summary.increment_count > 3 {
            let breakdown: Vec<String> = summary
                .by_profile
                .iter()
                .map(|(profile, count)| format!("{profile} {count}"))
                .collect();
            let _ = writeln!(out, "Breakdown: {}", breakdown.join(", "));
        }

        for inc in &self.increments {
            let _ = write!(
                out,
                "  {}. [{}] {} (~{} lines)",
                inc.index + 1,
                inc.worker_profile,
                inc.description,
                inc.estimated_lines
            );
            if !inc.dependencies.is_empty() {
                let deps: Vec<String> =
                    inc.dependencies.iter().map(|d| (d + 1).to_string()).collect();
                let _ = write!(out, " after {}", deps.join(", "));
            }
            out.push('\n');
        }
        out
    }
}
