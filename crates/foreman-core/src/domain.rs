//! Coarse work-item domains and the parallel-compatibility relation.
//!
//! A domain is derived purely from an item's labels and title; it exists only
//! so the scheduler can decide which items may run side by side.

use serde::{Deserialize, Serialize};

/// Coarse classification of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Backend,
    Frontend,
    Database,
    Infrastructure,
    Security,
    Testing,
    Documentation,
    Billing,
    Unknown,
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Domain::Backend => "backend",
            Domain::Frontend => "frontend",
            Domain::Database => "database",
            Domain::Infrastructure => "infrastructure",
            Domain::Security => "security",
            Domain::Testing => "testing",
            Domain::Documentation => "documentation",
            Domain::Billing => "billing",
            Domain::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Keyword table consulted in order: first match wins.
const KEYWORDS: &[(Domain, &[&str])] = &[
    (Domain::Database, &["database", "db", "migration", "sql", "schema"]),
    (Domain::Billing, &["billing", "payments", "payment", "invoice", "subscription"]),
    (Domain::Security, &["security", "auth", "authentication", "vulnerability", "cve"]),
    (Domain::Infrastructure, &["infrastructure", "infra", "ci", "cd", "deploy", "docker", "terraform"]),
    (Domain::Documentation, &["documentation", "docs", "doc", "readme"]),
    (Domain::Testing, &["testing", "tests", "test", "flaky"]),
    (Domain::Frontend, &["frontend", "ui", "ux", "css", "web"]),
    (Domain::Backend, &["backend", "api", "server", "service"]),
];

/// Label prefixes stripped before keyword comparison.
const LABEL_PREFIXES: &[&str] = &["area:", "domain:", "scope:", "type:"];

/// Classify a work item from its labels and title.
///
/// Labels are consulted first (prefix-stripped, exact keyword match), then
/// title words, then `Unknown`.
pub fn classify(labels: &[String], title: &str) -> Domain {
    for (domain, keywords) in KEYWORDS {
        for label in labels {
            let mut name = label.trim().to_ascii_lowercase();
            for prefix in LABEL_PREFIXES {
                if let Some(rest) = name.strip_prefix(prefix) {
                    name = rest.to_string();
                    break;
                }
            }
            if keywords.contains(&name.as_str()) {
                return *domain;
            }
        }
    }

    let title_words: Vec<String> = title
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_ascii_lowercase)
        .collect();
    for (domain, keywords) in KEYWORDS {
        if title_words.iter().any(|w| keywords.contains(&w.as_str())) {
            return *domain;
        }
    }

    Domain::Unknown
}

/// Whether two items may occupy the window at the same time.
///
/// The full table:
/// - `documentation` and `unknown` are compatible with everything;
/// - `database`, `billing` and `security` are incompatible with themselves
///   (shared migrations, ledgers and policy surfaces do not partition);
/// - every other pair, identical or not, is compatible.
pub fn can_run_parallel(a: Domain, b: Domain) -> bool {
    if a == Domain::Documentation || b == Domain::Documentation {
        return true;
    }
    if a == Domain::Unknown || b == Domain::Unknown {
        return true;
    }
    if a == b {
        return !matches!(a, Domain::Database | Domain::Billing | Domain::Security);
    }
    true
}

const SLUG_MAX_LEN: usize = 40;

/// Reduce a title to a short branch-safe slug: lowercase `[a-z0-9-]`, at
/// most 40 characters, no leading/trailing/doubled dashes.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(SLUG_MAX_LEN);
    let mut last_dash = true;
    for c in title.chars() {
        let mapped = if c.is_ascii_alphanumeric() {
            Some(c.to_ascii_lowercase())
        } else if last_dash {
            None
        } else {
            Some('-')
        };
        if let Some(m) = mapped {
            if slug.len() >= SLUG_MAX_LEN {
                break;
            }
            slug.push(m);
            last_dash = m == '-';
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "item".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn label_match_beats_title_match() {
        let domain = classify(&labels(&["area:database"]), "fix frontend rendering");
        assert_eq!(domain, Domain::Database);
    }

    #[test]
    fn title_keywords_used_when_labels_silent() {
        let domain = classify(&labels(&["p1"]), "add index to orders table migration");
        assert_eq!(domain, Domain::Database);
    }

    #[test]
    fn unlabelled_unmatched_is_unknown() {
        let domain = classify(&labels(&["p2"]), "improve things");
        assert_eq!(domain, Domain::Unknown);
    }

    #[test]
    fn prefixes_are_stripped() {
        assert_eq!(classify(&labels(&["scope:billing"]), "x"), Domain::Billing);
        assert_eq!(classify(&labels(&["domain:ui"]), "x"), Domain::Frontend);
    }

    #[test]
    fn classification_is_pure() {
        let l = labels(&["backend"]);
        assert_eq!(classify(&l, "t"), classify(&l, "t"));
    }

    #[test]
    fn restricted_domains_conflict_with_themselves() {
        assert!(!can_run_parallel(Domain::Database, Domain::Database));
        assert!(!can_run_parallel(Domain::Billing, Domain::Billing));
        assert!(!can_run_parallel(Domain::Security, Domain::Security));
    }

    #[test]
    fn identical_unrestricted_domains_are_compatible() {
        assert!(can_run_parallel(Domain::Backend, Domain::Backend));
        assert!(can_run_parallel(Domain::Frontend, Domain::Frontend));
        assert!(can_run_parallel(Domain::Testing, Domain::Testing));
    }

    #[test]
    fn documentation_and_unknown_pair_with_anything() {
        for d in [
            Domain::Backend,
            Domain::Database,
            Domain::Security,
            Domain::Billing,
        ] {
            assert!(can_run_parallel(Domain::Documentation, d));
            assert!(can_run_parallel(d, Domain::Documentation));
            assert!(can_run_parallel(Domain::Unknown, d));
            assert!(can_run_parallel(d, Domain::Unknown));
        }
    }

    #[test]
    fn compatibility_is_symmetric() {
        let all = [
            Domain::Backend,
            Domain::Frontend,
            Domain::Database,
            Domain::Infrastructure,
            Domain::Security,
            Domain::Testing,
            Domain::Documentation,
            Domain::Billing,
            Domain::Unknown,
        ];
        for a in all {
            for b in all {
                assert_eq!(can_run_parallel(a, b), can_run_parallel(b, a));
            }
        }
    }

    #[test]
    fn slugify_basic() {
        assert_eq!(slugify("Add index to users table"), "add-index-to-users-table");
    }

    #[test]
    fn slugify_strips_special_chars() {
        assert_eq!(slugify("Fix: crash on start!!"), "fix-crash-on-start");
    }

    #[test]
    fn slugify_truncates() {
        let long = "a".repeat(120);
        assert!(slugify(&long).len() <= 40);
    }

    #[test]
    fn slugify_never_empty() {
        assert_eq!(slugify("!!!"), "item");
        assert_eq!(slugify(""), "item");
    }

    #[test]
    fn slugify_no_doubled_or_edge_dashes() {
        let slug = slugify("  -- weird ---- title --");
        assert!(!slug.starts_with('-'));
        assert!(!slug.ends_with('-'));
        assert!(!slug.contains("--"));
    }
}
