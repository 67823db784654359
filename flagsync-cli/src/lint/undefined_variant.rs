use std::collections::HashSet;

use flagsync_lib::DesiredFlag;

use super::LintWarning;

pub fn check(flag: &DesiredFlag) -> Vec<LintWarning> {
    let mut warnings = Vec::new();
    let defined: HashSet<&str> = flag.variants.iter().map(|v| v.key.as_str()).collect();

    for (position, segment) in flag.segments.iter().enumerate() {
        for distribution in &segment.distributions {
            if !defined.contains(distribution.key.as_str()) {
                warnings.push(LintWarning::error(format!(
                    "{}: segment {} distributes to variant \"{}\" which is never declared",
                    flag.name, position, distribution.key
                )));
            }
        }
    }
    warnings
}
