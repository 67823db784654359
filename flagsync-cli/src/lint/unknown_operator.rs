use flagsync_lib::{DesiredFlag, Operator};

use super::LintWarning;

pub fn check(flag: &DesiredFlag) -> Vec<LintWarning> {
    let mut warnings = Vec::new();
    for (position, segment) in flag.segments.iter().enumerate() {
        for constraint in &segment.constraints {
            if Operator::from_token(&constraint.operator).is_none() {
                warnings.push(LintWarning::error(format!(
                    "{}: segment {} constraint on \"{}\" uses unknown operator \"{}\"",
                    flag.name, position, constraint.property, constraint.operator
                )));
            }
        }
    }
    warnings
}
