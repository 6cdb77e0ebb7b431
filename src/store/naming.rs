//! Semantic agent ids.
//!
//! Agent ids are readable slugs derived from the task description and the
//! worker profile, e.g. `backend-add-auth-user`, rather than random UUIDs.

use std::sync::LazyLock;

use regex::Regex;

use crate::profile::WorkerProfile;

/// Maximum length of a generated name, before any collision suffix.
pub const MAX_NAME_LEN: usize = 40;

const MAX_TERMS: usize = 3;

static WORD_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[a-z]+").unwrap());

static NON_SLUG_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "from", "as", "is", "was", "are", "were", "be", "been", "being", "have", "has", "had", "do",
    "does", "did", "will", "would", "should", "could", "may", "might", "must", "can", "this",
    "that", "these", "those", "i", "you", "he", "she", "it", "we", "they",
];

const ACTION_WORDS: &[&str] = &[
    "add", "create", "build", "implement", "fix", "debug", "refactor", "update", "modify",
    "delete", "remove", "test", "verify", "review", "optimize", "improve", "migrate", "deploy",
    "setup", "configure", "integrate", "document", "analyze", "design", "validate", "write",
];

const ABBREVIATIONS: &[(&str, &str)] = &[
    ("authentication", "auth"),
    ("authorization", "authz"),
    ("database", "db"),
    ("configuration", "config"),
    ("application", "app"),
    ("development", "dev"),
    ("production", "prod"),
    ("environment", "env"),
    ("repository", "repo"),
    ("documentation", "docs"),
    ("javascript", "js"),
    ("typescript", "ts"),
    ("integration", "integ"),
    ("implementation", "impl"),
    ("component", "comp"),
    ("navigation", "nav"),
    ("administration", "admin"),
    ("utilities", "utils"),
    ("middleware", "mw"),
    ("endpoint", "ep"),
];

/// Generate the semantic name for an agent.
///
/// `custom_name`, when given, is sanitized and used instead.
pub fn semantic_name(description: &str, profile: WorkerProfile, custom_name: Option<&str>) -> String {
    if let Some(custom) = custom_name {
        return sanitize(custom);
    }

    let mut parts = vec![profile.as_str().to_string()];
    parts.extend(key_terms(description, MAX_TERMS));
    truncate_at_word(&parts.join("-"), MAX_NAME_LEN)
}

/// Extract up to `max_terms` key terms: one action word first if present,
/// then the remaining content words in order, abbreviated.
pub fn key_terms(text: &str, max_terms: usize) -> Vec<String> {
    let lowered = text.to_lowercase();
    let words: Vec<&str> = WORD_REGEX
        .find_iter(&lowered)
        .map(|m| m.as_str())
        .filter(|w| w.len() > 2 && !STOP_WORDS.contains(w))
        .collect();

    if words.is_empty() {
        return vec!["task".to_string()];
    }

    let mut terms = Vec::with_capacity(max_terms);
    if let Some(action) = words.iter().find(|w| ACTION_WORDS.contains(w)) {
        terms.push(*action);
    }
    terms.extend(
        words
            .iter()
            .filter(|w| !ACTION_WORDS.contains(w))
            .take(max_terms.saturating_sub(terms.len())),
    );

    terms.into_iter().take(max_terms).map(abbreviate).collect()
}

fn abbreviate(word: &str) -> String {
    ABBREVIATIONS
        .iter()
        .find(|(long, _)| *long == word)
        .map(|(_, short)| short.to_string())
        .unwrap_or_else(|| word.to_string())
}

/// Lowercase, collapse anything outside `[a-z0-9]` to dashes, trim dashes.
pub fn sanitize(name: &str) -> String {
    let lowered = name.to_lowercase();
    let slug = NON_SLUG_REGEX.replace_all(&lowered, "-");
    let slug = truncate_at_word(slug.trim_matches('-'), MAX_NAME_LEN);
    if slug.is_empty() {
        "agent".to_string()
    } else {
        slug
    }
}

fn truncate_at_word(name: &str, max_len: usize) -> String {
    if name.len() <= max_len {
        return name.to_string();
    }
    let cut = &name[..max_len];
    match cut.rsplit_once('-') {
        Some((head, _)) if !head.is_empty() => head.to_string(),
        _ => cut.to_string(),
    }
}

/// Short random suffix used to disambiguate colliding names.
pub fn disambiguating_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..4].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_starts_with_profile_and_action() {
        let name = semantic_name("Add user authentication with JWT", WorkerProfile::Backend, None);
        assert_eq!(name, "backend-add-user-auth");
    }

    #[test]
    fn stop_words_and_short_words_are_dropped() {
        let terms = key_terms("Fix the navbar on it", 3);
        assert_eq!(terms, vec!["fix", "navbar"]);
    }

    #[test]
    fn abbreviates_long_terms() {
        let name = semantic_name("Refactor database configuration", WorkerProfile::Backend, None);
        assert_eq!(name, "backend-refactor-db-config");
    }

    #[test]
    fn empty_description_falls_back_to_task() {
        assert_eq!(semantic_name("!!", WorkerProfile::Test, None), "test-task");
    }

    #[test]
    fn long_names_are_cut_at_word_boundary() {
        let name = semantic_name(
            "Internationalization localization accessibility improvements",
            WorkerProfile::Orchestrator,
            None,
        );
        assert!(name.len() <= MAX_NAME_LEN);
        assert!(!name.ends_with('-'));
        assert!(name.starts_with("orchestrator-"));
    }

    #[test]
    fn custom_names_are_sanitized() {
        assert_eq!(
            semantic_name("ignored", WorkerProfile::Docs, Some("My Custom Agent!")),
            "my-custom-agent"
        );
        assert_eq!(sanitize("***"), "agent");
    }

    #[test]
    fn sanitize_lowercases_before_collapsing() {
        assert_eq!(sanitize("Parser_FIX v2"), "parser-fix-v2");
        assert_eq!(sanitize("--API--Gateway--"), "api-gateway");
    }

    #[test]
    fn naming_is_deterministic() {
        let a = semantic_name("Write tests for the login module", WorkerProfile::Test, None);
        let b = semantic_name("Write tests for the login module", WorkerProfile::Test, None);
        assert_eq!(a, b);
        assert_eq!(a, "test-write-tests-login");
    }

    #[test]
    fn suffix_is_short_hex() {
        let suffix = disambiguating_suffix();
        assert_eq!(suffix.len(), 4);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
