use flagsync_lib::DesiredFlag;

use super::LintWarning;

pub fn check(flag: &DesiredFlag) -> Vec<LintWarning> {
    flag.segments
        .iter()
        .enumerate()
        .filter(|(_, segment)| segment.rollout > 100)
        .map(|(position, segment)| {
            LintWarning::error(format!(
                "{}: segment {} rollout {}% is out of valid range (0-100)",
                flag.name, position, segment.rollout
            ))
        })
        .collect()
}
