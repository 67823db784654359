use flagsync_lib::{DesiredFlag, Operator};
use regex::Regex;

use super::LintWarning;

/// Regex constraints must carry a string that compiles.
pub fn check(flag: &DesiredFlag) -> Vec<LintWarning> {
    let mut warnings = Vec::new();
    for (position, segment) in flag.segments.iter().enumerate() {
        for constraint in &segment.constraints {
            let is_regex = Operator::from_token(&constraint.operator)
                .map(|op| op.is_regex())
                .unwrap_or(false);
            if !is_regex {
                continue;
            }
            let message = match constraint.value.as_str() {
                Some(pattern) => match Regex::new(pattern) {
                    Ok(_) => continue,
                    Err(e) => e.to_string(),
                },
                None => "pattern must be a string".to_string(),
            };
            warnings.push(LintWarning::error(format!(
                "{}: segment {} constraint on \"{}\" has an invalid pattern: {}",
                flag.name, position, constraint.property, message
            )));
        }
    }
    warnings
}
