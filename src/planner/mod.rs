//! Increment planner.
//!
//! Turns a request into an [`ExecutionPlan`] of small, ordered increments.
//! Planning is a pure function of the request text and the project context:
//! no I/O, no processes, and the same input always yields the same plan.
//! Every decision comes from the tables in [`rules`].

pub mod context;
pub mod rules;
pub mod types;

pub use context::{ContextDocument, ProjectContext};
pub use types::{ExecutionPlan, Increment, IncrementStatus, Layer, PlanShape, PlanSummary};

use tracing::{debug, warn};

use crate::profile::WorkerProfile;

/// Default upper bound on an increment's estimated size.
pub const DEFAULT_MAX_INCREMENT_LINES: u32 = 50;

/// Requests longer than this many words get a two-step generic breakdown.
const COMPLEX_REQUEST_WORDS: usize = 8;

const EMPTY_REQUEST_FALLBACK: &str = "Review the project and propose the next concrete step";

#[derive(Debug, Clone, Copy)]
pub struct Planner {
    max_increment_lines: u32,
}

impl Default for Planner {
    fn default() -> Self {
        Self {
            max_increment_lines: DEFAULT_MAX_INCREMENT_LINES,
        }
    }
}

/// Plan `request` with default settings.
pub fn plan(request: &str, context: &ProjectContext) -> ExecutionPlan {
    Planner::default().plan(request, context)
}

impl Planner {
    pub fn with_max_increment_lines(mut self, lines: u32) -> Self {
        self.max_increment_lines = lines.max(1);
        self
    }

    pub fn plan(&self, request: &str, context: &ProjectContext) -> ExecutionPlan {
        let request = request.trim();
        if rules::is_unintelligible(request) {
            let description = if request.is_empty() {
                EMPTY_REQUEST_FALLBACK
            } else {
                request
            };
            return ExecutionPlan::single(
                request,
                PlanShape::Generic,
                self.increment(0, description, WorkerProfile::Orchestrator, Layer::General, 30),
            );
        }

        let shape = rules::classify(request);
        let increments = match shape {
            PlanShape::DocsOnly => vec![self.increment(
                0,
                request,
                WorkerProfile::Docs,
                Layer::Docs,
                30,
            )],
            PlanShape::TestOnly => vec![self.increment(
                0,
                request,
                WorkerProfile::Test,
                Layer::Tests,
                45,
            )],
            PlanShape::DefectFix => self.plan_fix(request),
            PlanShape::Refactor => self.plan_refactor(request),
            PlanShape::Feature => self.plan_feature(request, context),
            PlanShape::Generic => vec![self.increment(
                0,
                request,
                WorkerProfile::Orchestrator,
                Layer::General,
                30,
            )],
        };

        debug!(%shape, increments = increments.len(), "planned request");
        match ExecutionPlan::new(request, shape, increments) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(error = %e, "planner produced an inconsistent plan, using a single increment");
                ExecutionPlan::single(
                    request,
                    PlanShape::Generic,
                    self.increment(0, request, WorkerProfile::Orchestrator, Layer::General, 30),
                )
            }
        }
    }

    fn increment(
        &self,
        index: usize,
        description: &str,
        profile: WorkerProfile,
        layer: Layer,
        estimated_lines: u32,
    ) -> Increment {
        Increment::new(
            index,
            description,
            profile,
            layer,
            estimated_lines.min(self.max_increment_lines),
        )
    }

    /// Canonical layer order with each layer depending on the one it builds
    /// on; tests depend on everything before them.
    fn plan_feature(&self, request: &str, context: &ProjectContext) -> Vec<Increment> {
        let mut layers = rules::detect_layers(request);
        let wants_tests = layers.contains(&Layer::Tests)
            || (!layers.is_empty() && context.advertises_test_framework());
        layers.retain(|l| *l != Layer::Tests);

        let mut increments: Vec<Increment> = Vec::new();
        if layers.is_empty() {
            if request.split_whitespace().count() > COMPLEX_REQUEST_WORDS {
                increments.push(self.increment(
                    0,
                    &format!("Implement core functionality: {request}"),
                    WorkerProfile::Orchestrator,
                    Layer::General,
                    50,
                ));
                increments.push(
                    self.increment(
                        1,
                        &format!("Add supporting features and integration: {request}"),
                        WorkerProfile::Orchestrator,
                        Layer::General,
                        45,
                    )
                    .depends_on([0]),
                );
            } else {
                increments.push(self.increment(
                    0,
                    request,
                    WorkerProfile::Orchestrator,
                    Layer::General,
                    40,
                ));
            }
        }

        let mut schema = None;
        let mut service = None;
        for layer in layers {
            let index = increments.len();
            let inc = match layer {
                Layer::Schema => {
                    schema = Some(index);
                    self.increment(
                        index,
                        &format!("Define data models and schema for: {request}"),
                        WorkerProfile::Backend,
                        layer,
                        40,
                    )
                }
                Layer::Service => {
                    service = Some(index);
                    self.increment(
                        index,
                        &format!("Implement service and API layer for: {request}"),
                        WorkerProfile::Backend,
                        layer,
                        45,
                    )
                    .depends_on(schema)
                }
                Layer::Presentation => self
                    .increment(
                        index,
                        &format!("Build user interface for: {request}"),
                        WorkerProfile::Frontend,
                        layer,
                        50,
                    )
                    .depends_on(service.or(schema)),
                _ => continue,
            };
            increments.push(inc);
        }

        if wants_tests {
            let index = increments.len();
            increments.push(
                self.increment(
                    index,
                    &format!("Write tests covering: {request}"),
                    WorkerProfile::Test,
                    Layer::Tests,
                    35,
                )
                .depends_on(0..index),
            );
        }
        increments
    }

    fn plan_fix(&self, request: &str) -> Vec<Increment> {
        let profile = code_profile(request);
        if rules::is_trivial_fix(request) {
            return vec![self.increment(0, request, profile, Layer::General, 10)];
        }
        vec![
            self.increment(
                0,
                &format!("Investigate and fix: {request}"),
                profile,
                Layer::General,
                30,
            ),
            self.increment(
                1,
                &format!("Add regression test for: {request}"),
                WorkerProfile::Test,
                Layer::Tests,
                25,
            )
            .depends_on([0]),
        ]
    }

    fn plan_refactor(&self, request: &str) -> Vec<Increment> {
        vec![
            self.increment(
                0,
                &format!("Refactor: {request}"),
                code_profile(request),
                Layer::General,
                40,
            ),
            self.increment(
                1,
                &format!("Verify refactoring with tests: {request}"),
                WorkerProfile::Test,
                Layer::Tests,
                30,
            )
            .depends_on([0]),
        ]
    }
}

/// Frontend when the request is about the UI, backend otherwise.
fn code_profile(request: &str) -> WorkerProfile {
    if rules::mentions_presentation(request) {
        WorkerProfile::Frontend
    } else {
        WorkerProfile::Backend
    }
}
