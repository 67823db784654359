use flagsync_lib::DesiredFlag;

use super::LintWarning;

pub fn check(flag: &DesiredFlag) -> Vec<LintWarning> {
    let mut warnings = Vec::new();
    for (position, segment) in flag.segments.iter().enumerate() {
        let total = segment.total_percent();
        if total != 100 {
            warnings.push(LintWarning::error(format!(
                "{}: segment {} distributions sum to {}%, expected 100%",
                flag.name, position, total
            )));
        }
    }
    warnings
}
