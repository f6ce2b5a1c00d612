//! Turning counter readings into reachability verdicts.

use serde::{Deserialize, Serialize};

use crate::error::{ReachError, Result};
use crate::net::rules::{RuleAction, RuleCounter};
use crate::net::Service;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Reachable,
    Blocked,
    /// The packet never arrived at the router.
    Unknown,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Reachable => write!(f, "REACHABLE"),
            Verdict::Blocked => write!(f, "BLOCKED"),
            Verdict::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Classify one (router, service) pair from its ingress and egress deltas.
///
/// A healthy router never forwards more tagged packets than it received, so
/// an egress delta above the ingress delta is reported as
/// [`ReachError::ConsistencyViolation`].
pub fn classify(pre_delta: u64, post_delta: u64, router: &str, service: &Service) -> Result<Verdict> {
    match (pre_delta, post_delta) {
        (0, 0) => Ok(Verdict::Unknown),
        (pre, post) if post > pre => Err(ReachError::ConsistencyViolation {
            router: router.to_string(),
            service: service.to_string(),
            pre,
            post,
        }),
        (_, 0) => Ok(Verdict::Blocked),
        _ => Ok(Verdict::Reachable),
    }
}

/// Quick-path result for one router and one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceVerdict {
    pub router: String,
    pub service: Service,
    pub verdict: Verdict,
    pub pre_delta: u64,
    pub post_delta: u64,
}

/// Change of one forward-chain rule across a probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDelta {
    pub rule_id: String,
    pub action: RuleAction,
    pub packets: u64,
    pub bytes: u64,
}

/// Per-rule deltas between two readings of the same chain.
///
/// Rules are matched by id. A rule absent from the baseline counts from
/// zero; counters that went backwards (rule replaced) yield zero.
pub fn rule_deltas(baseline: &[RuleCounter], after: &[RuleCounter]) -> Vec<RuleDelta> {
    after
        .iter()
        .map(|now| {
            let (packets, bytes) = baseline
                .iter()
                .find(|b| b.rule_id == now.rule_id)
                .map_or((0, 0), |b| (b.packets, b.bytes));
            RuleDelta {
                rule_id: now.rule_id.clone(),
                action: now.action,
                packets: now.packets.saturating_sub(packets),
                bytes: now.bytes.saturating_sub(bytes),
            }
        })
        .collect()
}

/// Rule with the largest positive packet delta. Ties go to the earlier rule
/// in chain order, since that one saw the packets first.
pub fn dominant_rule(deltas: &[RuleDelta]) -> Option<&RuleDelta> {
    deltas
        .iter()
        .filter(|d| d.packets > 0)
        .fold(None, |best: Option<&RuleDelta>, d| match best {
            Some(b) if b.packets >= d.packets => Some(b),
            _ => Some(d),
        })
}

/// Verdict implied by the dominant rule's target.
pub fn verdict_for(dominant: Option<&RuleDelta>) -> Verdict {
    match dominant.map(|d| d.action) {
        Some(RuleAction::Accept) => Verdict::Reachable,
        Some(RuleAction::Drop | RuleAction::Reject) => Verdict::Blocked,
        _ => Verdict::Unknown,
    }
}

/// Detailed-path result for one router and one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMeasurement {
    pub router: String,
    pub service: Service,
    pub deltas: Vec<RuleDelta>,
    pub dominant_rule: Option<String>,
    pub verdict: Verdict,
}

impl ServiceMeasurement {
    pub fn from_readings(router: &str, service: Service, baseline: &[RuleCounter], after: &[RuleCounter]) -> Self {
        let deltas = rule_deltas(baseline, after);
        let dominant = dominant_rule(&deltas);
        let verdict = verdict_for(dominant);
        let dominant_rule = dominant.map(|d| d.rule_id.clone());
        Self {
            router: router.to_string(),
            service,
            deltas,
            dominant_rule,
            verdict,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobReport {
    Quick {
        tag: u8,
        verdicts: Vec<ServiceVerdict>,
    },
    Detailed {
        measurements: Vec<ServiceMeasurement>,
    },
}

impl JobReport {
    /// `(router, service, verdict)` rows in report order.
    pub fn rows(&self) -> Vec<(&str, Service, Verdict)> {
        match self {
            JobReport::Quick { verdicts, .. } => verdicts
                .iter()
                .map(|v| (v.router.as_str(), v.service, v.verdict))
                .collect(),
            JobReport::Detailed { measurements } => measurements
                .iter()
                .map(|m| (m.router.as_str(), m.service, m.verdict))
                .collect(),
        }
    }

    pub fn verdict(&self, router: &str, service: &Service) -> Option<Verdict> {
        self.rows()
            .into_iter()
            .find(|(r, s, _)| *r == router && s == service)
            .map(|(_, _, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::rules::Hook;

    fn counter(id: &str, action: RuleAction, packets: u64) -> RuleCounter {
        RuleCounter {
            rule_id: id.to_string(),
            hook: Hook::Forward,
            action,
            counting: None,
            packets,
            bytes: packets * 60,
        }
    }

    #[test]
    fn classify_covers_every_case() {
        let svc = Service::tcp(80);
        assert_eq!(classify(4, 4, "r1", &svc).unwrap(), Verdict::Reachable);
        assert_eq!(classify(4, 0, "r1", &svc).unwrap(), Verdict::Blocked);
        assert_eq!(classify(0, 0, "r1", &svc).unwrap(), Verdict::Unknown);
        let err = classify(0, 3, "r1", &svc).unwrap_err();
        assert!(matches!(
            err,
            ReachError::ConsistencyViolation { pre: 0, post: 3, .. }
        ));
    }

    #[test]
    fn egress_above_ingress_is_a_violation() {
        let svc = Service::udp(53);
        assert_eq!(classify(3, 2, "r2", &svc).unwrap(), Verdict::Reachable);
        let err = classify(2, 5, "r2", &svc).unwrap_err();
        assert!(matches!(
            err,
            ReachError::ConsistencyViolation { pre: 2, post: 5, ref router, .. } if router == "r2"
        ));
    }

    #[test]
    fn dominant_rule_is_largest_positive_delta() {
        let baseline = vec![
            counter("FORWARD:1", RuleAction::Accept, 100),
            counter("FORWARD:2", RuleAction::Drop, 7),
        ];
        let after = vec![
            counter("FORWARD:1", RuleAction::Accept, 101),
            counter("FORWARD:2", RuleAction::Drop, 10),
            counter("FORWARD:3", RuleAction::Accept, 0),
        ];
        let m = ServiceMeasurement::from_readings("r1", Service::tcp(22), &baseline, &after);
        assert_eq!(m.dominant_rule.as_deref(), Some("FORWARD:2"));
        assert_eq!(m.verdict, Verdict::Blocked);
        assert_eq!(m.deltas.len(), 3);
    }

    #[test]
    fn no_movement_is_unknown() {
        let readings = vec![counter("FORWARD:1", RuleAction::Accept, 5)];
        let m = ServiceMeasurement::from_readings("r1", Service::udp(53), &readings, &readings);
        assert_eq!(m.dominant_rule, None);
        assert_eq!(m.verdict, Verdict::Unknown);
    }
}
