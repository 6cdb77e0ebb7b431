//! Keyword rules used by the planner.
//!
//! Every planning decision traces back to one entry in these tables. Rules
//! are matched against the lowercased request; for shapes the first match
//! wins.

use std::sync::LazyLock;

use regex::Regex;

use super::types::{Layer, PlanShape};

/// Shape rules in priority order. `Generic` is the fallback and has no rule.
static SHAPE_RULES: LazyLock<Vec<(PlanShape, Regex)>> = LazyLock::new(|| {
    vec![
        (
            PlanShape::DocsOnly,
            Regex::new(
                r"^\s*(?:(?:write|update|add|improve|create|fix)\s+(?:the\s+|a\s+|an\s+|some\s+)?(?:api\s+)?(?:docs|documentation|readme|changelog|docstrings?)\b|document\s)",
            )
            .unwrap(),
        ),
        (
            PlanShape::TestOnly,
            Regex::new(
                r"^\s*(?:(?:write|add|create|improve|increase|extend)\s+(?:more\s+|some\s+|missing\s+)?(?:unit\s+|integration\s+|e2e\s+|end-to-end\s+|regression\s+)?(?:tests?|test\s+coverage)\b|test\s|verify\s|check\s+that\b)",
            )
            .unwrap(),
        ),
        (
            PlanShape::DefectFix,
            Regex::new(
                r"^\s*(?:fix|resolve|debug|repair|correct|patch)\b|\b(?:bug|bugs|crash|crashes|broken|typo|typos)\b",
            )
            .unwrap(),
        ),
        (
            PlanShape::Refactor,
            Regex::new(
                r"^\s*(?:refactor|restructure|reorganize|clean\s+up|simplify|optimi[sz]e|improve|extract|migrate)\b|\brefactor",
            )
            .unwrap(),
        ),
        (
            PlanShape::Feature,
            Regex::new(
                r"\b(?:add|create|implement|build|introduce|support|enable|develop|set\s+up|setup|make)\b",
            )
            .unwrap(),
        ),
    ]
});

/// Layer keyword table, in canonical order.
static LAYER_RULES: LazyLock<Vec<(Layer, Regex)>> = LazyLock::new(|| {
    vec![
        (
            Layer::Schema,
            Regex::new(
                r"\b(?:schema|schemas|models?|database|db|tables?|migrations?|entity|entities|persist\w*|storage|sql|orm)\b",
            )
            .unwrap(),
        ),
        (
            Layer::Service,
            Regex::new(
                r"\b(?:api|apis|endpoints?|services?|backend|server|routes?|handlers?|rest|graphql|controllers?)\b",
            )
            .unwrap(),
        ),
        (
            Layer::Presentation,
            Regex::new(
                r"\b(?:ui|frontend|front-end|pages?|forms?|components?|screens?|views?|buttons?|dashboard|layout|css|styles?|react|vue|html)\b",
            )
            .unwrap(),
        ),
        (
            Layer::Tests,
            Regex::new(r"\b(?:tests?|testing|specs?|coverage)\b").unwrap(),
        ),
    ]
});

/// Authentication work needs both persistence and a service.
static AUTH_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(?:auth|authentication|authorization|login|logout|signup|sign-up|sign\s+in|register|registration|passwords?|sessions?|jwt|oauth)\b",
    )
    .unwrap()
});

/// Trivial fixes that need no regression test.
static TRIVIAL_FIX_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:typos?|spelling|rename|renaming|wording)\b").unwrap());

/// Test frameworks a project context may advertise.
static TEST_FRAMEWORK_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:pytest|unittest|jest|vitest|mocha|cypress|playwright|junit|rspec|cargo\s+test|go\s+test|test\s+framework)\b",
    )
    .unwrap()
});

/// Any alphanumeric content at all.
static WORD_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[[:alnum:]]{2,}").unwrap());

pub fn classify(request: &str) -> PlanShape {
    let lowered = request.to_lowercase();
    SHAPE_RULES
        .iter()
        .find(|(_, rule)| rule.is_match(&lowered))
        .map(|(shape, _)| *shape)
        .unwrap_or(PlanShape::Generic)
}

/// Layers the request implies, in canonical order, without duplicates.
pub fn detect_layers(request: &str) -> Vec<Layer> {
    let lowered = request.to_lowercase();
    let auth = AUTH_REGEX.is_match(&lowered);
    LAYER_RULES
        .iter()
        .filter(|(layer, rule)| {
            rule.is_match(&lowered) || (auth && matches!(layer, Layer::Schema | Layer::Service))
        })
        .map(|(layer, _)| *layer)
        .collect()
}

pub fn is_trivial_fix(request: &str) -> bool {
    TRIVIAL_FIX_REGEX.is_match(&request.to_lowercase())
}

/// Whether the request talks about the presentation layer.
pub fn mentions_presentation(request: &str) -> bool {
    detect_layers(request).contains(&Layer::Presentation)
}

pub fn advertises_test_framework(text: &str) -> bool {
    TEST_FRAMEWORK_REGEX.is_match(text)
}

/// A request with nothing to act on.
pub fn is_unintelligible(request: &str) -> bool {
    !WORD_REGEX.is_match(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shapes_follow_rule_priority() {
        assert_eq!(classify("Write tests for the login module"), PlanShape::TestOnly);
        assert_eq!(classify("Add unit tests for parser"), PlanShape::TestOnly);
        assert_eq!(classify("Update the README with setup steps"), PlanShape::DocsOnly);
        assert_eq!(classify("Fix crash when saving profile"), PlanShape::DefectFix);
        assert_eq!(classify("There is a typo in the header"), PlanShape::DefectFix);
        assert_eq!(classify("Refactor the payment module"), PlanShape::Refactor);
        assert_eq!(
            classify("Add user authentication with login UI, API, and tests"),
            PlanShape::Feature
        );
        assert_eq!(classify("Hello there"), PlanShape::Generic);
    }

    #[test]
    fn test_verification_requests_are_test_only() {
        assert_eq!(
            classify("Verify the checkout flow handles empty carts"),
            PlanShape::TestOnly
        );
        assert_eq!(
            classify("Check that login rejects bad passwords"),
            PlanShape::TestOnly
        );
    }

    #[test]
    fn test_feature_mentioning_tests_is_not_test_only() {
        assert_eq!(classify("Create a profile page and tests"), PlanShape::Feature);
    }

    #[test]
    fn test_auth_implies_schema_and_service() {
        assert_eq!(
            detect_layers("Add login"),
            vec![Layer::Schema, Layer::Service]
        );
    }

    #[test]
    fn test_layers_come_out_in_canonical_order() {
        assert_eq!(
            detect_layers("tests for the UI, the API and the database"),
            vec![Layer::Schema, Layer::Service, Layer::Presentation, Layer::Tests]
        );
    }

    #[test]
    fn test_trivial_fix_detection() {
        assert!(is_trivial_fix("Fix typo in footer"));
        assert!(!is_trivial_fix("Fix race in scheduler"));
    }

    #[test]
    fn test_framework_detection_is_case_insensitive() {
        assert!(advertises_test_framework("Testing: PyTest with fixtures"));
        assert!(!advertises_test_framework("Python 3.12, FastAPI"));
    }

    #[test]
    fn test_unintelligible_requests() {
        assert!(is_unintelligible(""));
        assert!(is_unintelligible("  ?! -- "));
        assert!(!is_unintelligible("do it"));
    }
}
