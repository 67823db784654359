use flagsync_lib::DesiredFlag;

use super::LintWarning;

pub fn check(flag: &DesiredFlag) -> Vec<LintWarning> {
    let mut warnings = Vec::new();
    if flag.variants.is_empty() {
        warnings.push(LintWarning::warn(format!(
            "{}: flag has no variants (evaluates to nothing)",
            flag.name
        )));
    }
    warnings
}
