use std::collections::HashSet;

use flagsync_lib::DesiredFlag;

use super::LintWarning;

pub fn check(flag: &DesiredFlag) -> Vec<LintWarning> {
    let mut warnings = Vec::new();
    let mut seen = HashSet::new();
    for variant in &flag.variants {
        if !seen.insert(variant.key.as_str()) {
            warnings.push(LintWarning::error(format!(
                "{}: variant \"{}\" is declared more than once",
                flag.name, variant.key
            )));
        }
    }
    warnings
}
