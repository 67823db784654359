use flagsync_lib::{DesiredFlag, DesiredSegment};

use super::LintWarning;

pub fn check(flag: &DesiredFlag) -> Vec<LintWarning> {
    let mut warnings = Vec::new();
    let unreachable = find_unreachable(&flag.segments);
    if !unreachable.is_empty() {
        warnings.push(LintWarning::warn(format!(
            "{}: {} unreachable segment(s) after catch-all",
            flag.name,
            unreachable.len()
        )));
    }
    warnings
}

/// A segment that matches everyone at full rollout shadows every later one.
fn find_unreachable(segments: &[DesiredSegment]) -> Vec<usize> {
    let mut unreachable = Vec::new();
    let mut found_catchall = false;
    for (i, segment) in segments.iter().enumerate() {
        if found_catchall {
            unreachable.push(i);
            continue;
        }
        if segment.rollout >= 100 && segment.constraints.is_empty() {
            found_catchall = true;
        }
    }
    unreachable
}

#[cfg(test)]
mod tests {
    use flagsync_lib::DesiredConstraint;

    use super::*;

    fn segment(rollout: u32, constrained: bool) -> DesiredSegment {
        let constraints = if constrained {
            vec![DesiredConstraint {
                property: "plan".into(),
                operator: "==".into(),
                value: serde_json::json!("pro"),
            }]
        } else {
            Vec::new()
        };
        DesiredSegment {
            rollout,
            constraints,
            ..Default::default()
        }
    }

    #[test]
    fn test_segments_after_catchall_are_unreachable() {
        let segments = vec![
            segment(100, true),
            segment(100, false),
            segment(50, true),
            segment(100, false),
        ];
        assert_eq!(find_unreachable(&segments), vec![2, 3]);
    }

    #[test]
    fn test_partial_rollout_is_not_a_catchall() {
        let segments = vec![segment(99, false), segment(100, false)];
        assert!(find_unreachable(&segments).is_empty());
    }
}
