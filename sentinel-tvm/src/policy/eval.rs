//! Pure policy evaluation (spec §4.B), structurally mirroring the
//! teacher's `policy::eval::evaluate`/`validate_structure` pair: a total,
//! side-effect-free function plus a pre-flight structural validator with
//! fixed depth/node limits to bound adversarial policy documents.

use crate::error::PolicyError;
use crate::posture::DevicePosture;
use chrono::{Datelike, Timelike};

use super::types::{Effect, Mode, Policy, Rule, POLICY_SCHEMA_VERSION};

/// Guards against pathologically large policy documents; Sentinel's rule
/// list has no nesting so only the node count is meaningful here, but the
/// depth constant is kept so future nested condition types inherit it.
pub const MAX_DEPTH: usize = 8;
pub const MAX_NODES: usize = 256;

/// The fields a single authorization request contributes to evaluation.
#[derive(Debug, Clone)]
pub struct EvalRequest<'a> {
    pub user: &'a str,
    pub profile: &'a str,
    pub mode: Mode,
    pub now_utc: chrono::DateTime<chrono::Utc>,
    pub posture: Option<&'a DevicePosture>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow { capped_duration: Option<u64> },
    Deny,
    RequireApproval { auto_approve: bool, capped_duration: Option<u64> },
}

/// Rejects policies with an unsupported schema version or a rule list that
/// exceeds the structural limits. Called once, before `evaluate`, so
/// `evaluate` itself never has to fail.
pub fn validate_structure(policy: &Policy) -> Result<(), PolicyError> {
    if policy.version != POLICY_SCHEMA_VERSION {
        return Err(PolicyError::UnsupportedVersion(policy.version.clone()));
    }
    if policy.rules.len() > MAX_NODES {
        return Err(PolicyError::Validation(format!(
            "policy has {} rules, exceeding the {} limit",
            policy.rules.len(),
            MAX_NODES
        )));
    }
    for rule in &policy.rules {
        if rule.effect.is_none() {
            return Err(PolicyError::Validation("rule missing effect".into()));
        }
    }
    Ok(())
}

/// First-match-wins evaluation over `policy.rules`. Pure: no I/O, no clock
/// reads beyond what `request.now_utc` supplies.
pub fn evaluate(policy: &Policy, request: &EvalRequest<'_>) -> Decision {
    for rule in &policy.rules {
        if rule_matches(rule, request) {
            return decision_for(rule);
        }
    }
    Decision::Deny
}

fn decision_for(rule: &Rule) -> Decision {
    match rule.effect.expect("validate_structure rejects ruleless effects") {
        Effect::Allow => Decision::Allow {
            capped_duration: rule.max_server_duration,
        },
        Effect::Deny => Decision::Deny,
        Effect::RequireApproval => Decision::RequireApproval {
            auto_approve: rule.auto_approve,
            capped_duration: rule.max_server_duration,
        },
    }
}

fn rule_matches(rule: &Rule, request: &EvalRequest<'_>) -> bool {
    if rule.is_wildcard() {
        return true;
    }
    if !rule.profiles.is_empty() && !rule.profiles.iter().any(|p| p == request.profile) {
        return false;
    }
    if !rule.users.is_empty() && !rule.users.iter().any(|u| u == request.user) {
        return false;
    }
    if !rule.mode.is_empty() && !rule.mode.iter().any(|m| *m == request.mode) {
        return false;
    }
    if let Some(window) = &rule.time_window {
        if !time_window_matches(window, request.now_utc) {
            return false;
        }
    }
    if let Some(device) = &rule.device {
        if !device.is_empty() && !device_condition_matches(device, request.posture) {
            return false;
        }
    }
    true
}

fn time_window_matches(window: &super::types::TimeWindow, now: chrono::DateTime<chrono::Utc>) -> bool {
    if !window.days.is_empty() {
        let weekday = now.weekday().num_days_from_sunday() as u8;
        if !window.days.contains(&weekday) {
            return false;
        }
    }
    let (Some(start), Some(end)) = (parse_hhmm(&window.start), parse_hhmm(&window.end)) else {
        return false;
    };
    let minutes_now = now.hour() * 60 + now.minute();
    // start-inclusive, end-exclusive
    minutes_now >= start && minutes_now < end
}

fn parse_hhmm(s: &str) -> Option<u32> {
    let (h, m) = s.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

/// Nil posture fails any non-empty device condition — fail-closed at the
/// policy layer (spec §4.C).
fn device_condition_matches(
    condition: &super::types::DeviceCondition,
    posture: Option<&DevicePosture>,
) -> bool {
    let Some(posture) = posture else {
        return false;
    };
    if condition.require_mdm && !posture.mdm_enrolled {
        return false;
    }
    if condition.require_compliant && posture.status != crate::posture::PostureStatus::Compliant {
        return false;
    }
    if condition.require_encryption && !posture.encrypted {
        return false;
    }
    if let Some(min_version) = &condition.min_os_version {
        if version_lt(&posture.os_version, min_version) {
            return false;
        }
    }
    true
}

/// Numeric comparison of dotted version strings (`"9.0"` vs `"10.0"`), since
/// `&str < &str` is lexicographic and would put `"10.0"` before `"9.0"`.
/// Missing trailing components compare as `0` (`"9"` == `"9.0"`); a
/// non-numeric component makes the whole string incomparable and the
/// condition fails closed (`lhs < rhs`).
fn version_lt(lhs: &str, rhs: &str) -> bool {
    let parse = |v: &str| -> Option<Vec<u64>> { v.split('.').map(|part| part.parse::<u64>().ok()).collect() };
    match (parse(lhs), parse(rhs)) {
        (Some(l), Some(r)) => {
            let len = l.len().max(r.len());
            for i in 0..len {
                let lv = l.get(i).copied().unwrap_or(0);
                let rv = r.get(i).copied().unwrap_or(0);
                if lv != rv {
                    return lv < rv;
                }
            }
            false
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::types::{DeviceCondition, Rule};
    use crate::posture::PostureStatus;
    use chrono::TimeZone;

    fn base_request(now: chrono::DateTime<chrono::Utc>) -> EvalRequest<'static> {
        EvalRequest {
            user: "alice",
            profile: "dev-read",
            mode: Mode::Server,
            now_utc: now,
            posture: None,
        }
    }

    #[test]
    fn wildcard_rule_matches_anything() {
        let policy = Policy::new(vec![Rule {
            effect: Some(Effect::Allow),
            ..Default::default()
        }]);
        let req = base_request(chrono::Utc::now());
        assert_eq!(
            evaluate(&policy, &req),
            Decision::Allow { capped_duration: None }
        );
    }

    #[test]
    fn first_match_wins_over_later_allow() {
        let policy = Policy::new(vec![
            Rule {
                effect: Some(Effect::Deny),
                profiles: vec!["prod".into()],
                ..Default::default()
            },
            Rule {
                effect: Some(Effect::Allow),
                ..Default::default()
            },
        ]);
        let mut req = base_request(chrono::Utc::now());
        req.profile = "prod";
        assert_eq!(evaluate(&policy, &req), Decision::Deny);
    }

    #[test]
    fn no_match_defaults_to_deny() {
        let policy = Policy::new(vec![Rule {
            effect: Some(Effect::Allow),
            profiles: vec!["dev-read".into()],
            ..Default::default()
        }]);
        let mut req = base_request(chrono::Utc::now());
        req.profile = "prod";
        assert_eq!(evaluate(&policy, &req), Decision::Deny);
    }

    #[test]
    fn nil_posture_fails_device_condition() {
        let policy = Policy::new(vec![Rule {
            effect: Some(Effect::Allow),
            device: Some(DeviceCondition {
                require_mdm: true,
                ..Default::default()
            }),
            ..Default::default()
        }]);
        let req = base_request(chrono::Utc::now());
        assert_eq!(evaluate(&policy, &req), Decision::Deny);
    }

    #[test]
    fn enrolled_device_posture_matches() {
        let policy = Policy::new(vec![Rule {
            effect: Some(Effect::Allow),
            device: Some(DeviceCondition {
                require_mdm: true,
                ..Default::default()
            }),
            ..Default::default()
        }]);
        let posture = DevicePosture {
            device_id: "a".repeat(64),
            status: PostureStatus::Compliant,
            mdm_enrolled: true,
            encrypted: true,
            os_version: "14.0".into(),
            last_seen: chrono::Utc::now(),
        };
        let mut req = base_request(chrono::Utc::now());
        req.posture = Some(&posture);
        assert_eq!(
            evaluate(&policy, &req),
            Decision::Allow { capped_duration: None }
        );
    }

    #[test]
    fn time_window_excludes_outside_hours() {
        let policy = Policy::new(vec![Rule {
            effect: Some(Effect::Allow),
            time_window: Some(super::super::types::TimeWindow {
                days: vec![1, 2, 3, 4, 5],
                start: "09:00".into(),
                end: "17:00".into(),
            }),
            ..Default::default()
        }]);
        // 2024-01-08 is a Monday (day 1); 20:00 UTC is outside the window.
        let now = chrono::Utc.with_ymd_and_hms(2024, 1, 8, 20, 0, 0).unwrap();
        let req = base_request(now);
        assert_eq!(evaluate(&policy, &req), Decision::Deny);
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let policy = Policy {
            version: "v2".into(),
            rules: vec![],
        };
        assert!(matches!(
            validate_structure(&policy),
            Err(PolicyError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn rule_without_effect_is_rejected() {
        let policy = Policy::new(vec![Rule::default()]);
        assert!(matches!(
            validate_structure(&policy),
            Err(PolicyError::Validation(_))
        ));
    }

    #[test]
    fn require_approval_carries_auto_approve_flag() {
        let policy = Policy::new(vec![Rule {
            effect: Some(Effect::RequireApproval),
            auto_approve: true,
            ..Default::default()
        }]);
        let req = base_request(chrono::Utc::now());
        assert_eq!(
            evaluate(&policy, &req),
            Decision::RequireApproval {
                auto_approve: true,
                capped_duration: None
            }
        );
    }

    #[test]
    fn version_comparison_is_numeric_not_lexicographic() {
        // "10.0" sorts before "9.0" lexicographically but not numerically.
        assert!(!version_lt("10.0", "9.0"));
        assert!(version_lt("9.0", "10.0"));
        assert!(!version_lt("14.2", "14.2"));
        assert!(version_lt("14", "14.1"));
        assert!(!version_lt("14.1", "14"));
        assert!(version_lt("not-a-version", "14.0"));
    }

    #[test]
    fn min_os_version_condition_uses_numeric_comparison() {
        let condition = DeviceCondition {
            min_os_version: Some("10.0".into()),
            ..Default::default()
        };
        let base_posture = |os_version: &str| DevicePosture {
            device_id: "a".repeat(64),
            status: PostureStatus::Compliant,
            mdm_enrolled: true,
            encrypted: true,
            os_version: os_version.into(),
            last_seen: chrono::Utc::now(),
        };
        assert!(!device_condition_matches(&condition, Some(&base_posture("9.5"))));
        assert!(device_condition_matches(&condition, Some(&base_posture("10.5"))));
    }
}
