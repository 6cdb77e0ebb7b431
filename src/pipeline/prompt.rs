//! Task text handed to a worker on stdin.

use crate::planner::{Increment, ProjectContext};

/// Build the task text for one attempt at `increment`.
///
/// `feedback` carries what went wrong on the previous attempt, if any.
pub fn build_task_text(
    increment: &Increment,
    request: &str,
    context: &ProjectContext,
    feedback: Option<&str>,
    attempt: u32,
) -> String {
    let mut text = format!(
        r#"You are completing one small increment of a larger request.

## REQUEST
{}

## INCREMENT {}
{}
"#,
        request.trim(),
        increment.index + 1,
        increment.description
    );

    let context_section = context.prompt_section();
    if !context_section.is_empty() {
        text.push('\n');
        text.push_str(&context_section);
    }

    text.push_str(&format!(
        r#"
## RULES
1. Keep the change to roughly {} lines
2. Only do this increment; later increments handle the rest
3. Write any produced artifacts to the directory in $FOREMAN_RESULT_DIR
4. Exit with status 0 only when the increment is done
"#,
        increment.estimated_lines
    ));

    if let Some(feedback) = feedback {
        text.push_str(&format!(
            "\n## PREVIOUS ATTEMPT FAILED (this is attempt {attempt})\n{}\n",
            feedback.trim()
        ));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{ContextDocument, Layer};
    use crate::profile::WorkerProfile;

    fn increment() -> Increment {
        Increment::new(
            1,
            "Implement service and API layer for: login",
            WorkerProfile::Backend,
            Layer::Service,
            45,
        )
    }

    #[test]
    fn first_attempt_has_no_feedback_section() {
        let text = build_task_text(&increment(), "login", &ProjectContext::default(), None, 1);
        assert!(text.contains("## INCREMENT 2\nImplement service and API layer for: login"));
        assert!(text.contains("roughly 45 lines"));
        assert!(!text.contains("PREVIOUS ATTEMPT"));
        assert!(!text.contains("Project Context"));
    }

    #[test]
    fn retry_includes_feedback_and_context() {
        let context = ProjectContext::new(vec![ContextDocument {
            name: "conventions".into(),
            content: "Use snake_case".into(),
        }]);
        let text = build_task_text(
            &increment(),
            "login",
            &context,
            Some("exited with code 1"),
            2,
        );
        assert!(text.contains("## PREVIOUS ATTEMPT FAILED (this is attempt 2)\nexited with code 1"));
        assert!(text.contains("Use snake_case"));
    }
}
