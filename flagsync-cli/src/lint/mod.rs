mod distribution_sum;
mod duplicate_variants;
mod empty_flag;
mod invalid_regex;
mod percentage_range;
mod undefined_variant;
mod unknown_operator;
mod unreachable_segments;

use std::io::{self, IsTerminal};

use flagsync_lib::Document;
use tracing::error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LintLevel {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LintWarning {
    pub level: LintLevel,
    pub message: String,
}

impl LintWarning {
    pub fn warn(message: impl Into<String>) -> Self {
        Self {
            level: LintLevel::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: LintLevel::Error,
            message: message.into(),
        }
    }
}

/// Run every rule against every flag of `document`.
pub fn lint_document(document: &Document) -> Vec<LintWarning> {
    let mut warnings = Vec::new();
    for flag in &document.flags {
        warnings.extend(empty_flag::check(flag));
        warnings.extend(duplicate_variants::check(flag));
        warnings.extend(percentage_range::check(flag));
        warnings.extend(distribution_sum::check(flag));
        warnings.extend(undefined_variant::check(flag));
        warnings.extend(unknown_operator::check(flag));
        warnings.extend(invalid_regex::check(flag));
        warnings.extend(unreachable_segments::check(flag));
    }
    warnings
}

/// Parse and lint the document at `path`. Prints findings to stderr and
/// returns Err(()) when the document is unreadable or an error-level rule
/// fired.
pub fn run_lint(path: &str) -> Result<(), ()> {
    let document = match Document::from_path(path) {
        Ok(document) => document,
        Err(e) => {
            error!("{}", e);
            return Err(());
        }
    };

    let use_color = io::stderr().is_terminal();
    let warn_icon = if use_color {
        "\x1b[33m\u{26a0}\x1b[0m"
    } else {
        "\u{26a0}"
    };
    let error_icon = if use_color {
        "\x1b[31m\u{26a0}\x1b[0m"
    } else {
        "\u{26a0}"
    };

    let warnings = lint_document(&document);
    if warnings.is_empty() {
        println!("{} ok, {} flags, no warnings", path, document.flags.len());
        return Ok(());
    }

    for w in &warnings {
        let icon = match w.level {
            LintLevel::Warning => warn_icon,
            LintLevel::Error => error_icon,
        };
        eprintln!("{} {}", icon, w.message);
    }
    eprintln!();
    let errors = warnings
        .iter()
        .filter(|w| w.level == LintLevel::Error)
        .count();
    eprintln!("{} warnings found ({} errors)", warnings.len(), errors);

    if errors > 0 {
        Err(())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lint(yaml: &str) -> Vec<LintWarning> {
        lint_document(&Document::from_yaml_str(yaml).unwrap())
    }

    #[test]
    fn test_clean_document_has_no_warnings() {
        let warnings = lint(
            r#"
flags:
  checkout:
    variants:
      - key: on
      - key: off
    segments:
      - rollout: 50
        constraints:
          - property: email
            operator: "=~"
            value: "@example\\.com$"
        distributions:
          - key: on
            percent: 100
      - rollout: 100
        distributions:
          - key: on
            percent: 20
          - key: off
            percent: 80
"#,
        );
        assert!(warnings.is_empty(), "{:?}", warnings);
    }

    #[test]
    fn test_findings_from_several_rules_are_collected() {
        let warnings = lint(
            r#"
flags:
  a: {}
  b:
    variants:
      - key: on
      - key: on
    segments:
      - rollout: 120
        constraints:
          - property: plan
            operator: LIKE
            value: x
        distributions:
          - key: off
            percent: 90
"#,
        );
        let errors = warnings
            .iter()
            .filter(|w| w.level == LintLevel::Error)
            .count();
        // a: no variants (warn); b: duplicate key, rollout range, sum,
        // undefined variant, unknown operator
        assert_eq!(warnings.len(), 6, "{:?}", warnings);
        assert_eq!(errors, 5);
    }

    #[test]
    fn test_run_lint_reports_unreadable_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.yaml");
        assert!(run_lint(path.to_str().unwrap()).is_err());
    }

    #[test]
    fn test_run_lint_passes_with_only_warnings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flags.yaml");
        std::fs::write(&path, "flags:\n  empty: {}\n").unwrap();
        assert!(run_lint(path.to_str().unwrap()).is_ok());
    }
}
