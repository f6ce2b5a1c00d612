use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::net::{Protocol, Service};

/// Prefix of the comment attached to every counting rule this crate installs.
pub const RULE_COMMENT_PREFIX: &str = "rl";

/// Where in the router's packet path a rule sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Hook {
    /// Ingress, before the routing decision.
    PreRouting,
    /// Egress, after the routing decision and the forward filter.
    PostRouting,
    /// The forward filter chain itself.
    Forward,
}

impl Hook {
    pub fn chain(&self) -> &'static str {
        match self {
            Hook::PreRouting => "PREROUTING",
            Hook::PostRouting => "POSTROUTING",
            Hook::Forward => "FORWARD",
        }
    }

    fn short(&self) -> &'static str {
        match self {
            Hook::PreRouting => "pre",
            Hook::PostRouting => "post",
            Hook::Forward => "fwd",
        }
    }

    fn from_short(s: &str) -> Option<Self> {
        match s {
            "pre" => Some(Hook::PreRouting),
            "post" => Some(Hook::PostRouting),
            "fwd" => Some(Hook::Forward),
            _ => None,
        }
    }
}

/// A match-only rule that counts one job's tagged packets for one service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CountingRule {
    pub hook: Hook,
    pub tag: u8,
    pub job_id: Uuid,
    pub service: Service,
}

impl CountingRule {
    /// Both rules of a (service, router) pair.
    pub fn pair(tag: u8, job_id: Uuid, service: Service) -> [CountingRule; 2] {
        [
            CountingRule {
                hook: Hook::PreRouting,
                tag,
                job_id,
                service,
            },
            CountingRule {
                hook: Hook::PostRouting,
                tag,
                job_id,
                service,
            },
        ]
    }

    /// Identifier embedded in the rule, e.g. `rl:32:<uuid>:pre:tcp:80`.
    pub fn comment(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}",
            RULE_COMMENT_PREFIX,
            self.tag,
            self.job_id,
            self.hook.short(),
            self.service.protocol,
            self.service.port
        )
    }

    pub fn parse_comment(comment: &str) -> Option<Self> {
        let mut parts = comment.split(':');
        if parts.next()? != RULE_COMMENT_PREFIX {
            return None;
        }
        let tag = parts.next()?.parse().ok()?;
        let job_id = parts.next()?.parse().ok()?;
        let hook = Hook::from_short(parts.next()?)?;
        let protocol: Protocol = parts.next()?.parse().ok()?;
        let port = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(CountingRule {
            hook,
            tag,
            job_id,
            service: Service { protocol, port },
        })
    }
}

/// Selects rules by tag and, optionally, job id and hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuleSelector {
    pub tag: Option<u8>,
    pub job_id: Option<Uuid>,
    pub hook: Option<Hook>,
}

impl RuleSelector {
    /// Every rule bearing `tag`, whichever job installed it.
    pub fn tag(tag: u8) -> Self {
        Self {
            tag: Some(tag),
            ..Default::default()
        }
    }

    /// Only the rules `job_id` installed under `tag`.
    pub fn job(tag: u8, job_id: Uuid) -> Self {
        Self {
            tag: Some(tag),
            job_id: Some(job_id),
            hook: None,
        }
    }

    /// All rules of the forward filter chain, ours or not.
    pub fn forward_chain() -> Self {
        Self {
            hook: Some(Hook::Forward),
            ..Default::default()
        }
    }

    pub fn matches(&self, rule: &CountingRule) -> bool {
        self.tag.map_or(true, |t| t == rule.tag)
            && self.job_id.map_or(true, |j| j == rule.job_id)
            && self.hook.map_or(true, |h| h == rule.hook)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleAction {
    Accept,
    Drop,
    Reject,
    /// Counting rule, or a jump to a user chain.
    Other,
}

impl RuleAction {
    pub fn from_target(target: &str) -> Self {
        match target {
            "ACCEPT" => RuleAction::Accept,
            "DROP" => RuleAction::Drop,
            "REJECT" => RuleAction::Reject,
            _ => RuleAction::Other,
        }
    }
}

/// One counter reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleCounter {
    /// Stable identifier of the rule within its router.
    pub rule_id: String,
    pub hook: Hook,
    pub action: RuleAction,
    /// Set for rules this crate installed.
    pub counting: Option<CountingRule>,
    pub packets: u64,
    pub bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comment_round_trips() {
        let job = Uuid::new_v4();
        let [pre, post] = CountingRule::pair(33, job, Service::tcp(443));
        assert_eq!(CountingRule::parse_comment(&pre.comment()), Some(pre.clone()));
        assert_eq!(CountingRule::parse_comment(&post.comment()), Some(post));
        assert!(pre.comment().starts_with("rl:33:"));
    }

    #[test]
    fn foreign_comments_are_ignored() {
        assert_eq!(CountingRule::parse_comment("allow ssh"), None);
        assert_eq!(CountingRule::parse_comment("rl:notatag"), None);
        assert_eq!(CountingRule::parse_comment("rl:1:x:pre:tcp:80"), None);
    }

    #[test]
    fn selector_by_tag_ignores_job() {
        let [rule, _] = CountingRule::pair(40, Uuid::new_v4(), Service::udp(53));
        assert!(RuleSelector::tag(40).matches(&rule));
        assert!(!RuleSelector::tag(41).matches(&rule));
        assert!(!RuleSelector::job(40, Uuid::new_v4()).matches(&rule));
        assert!(RuleSelector::job(40, rule.job_id).matches(&rule));
    }
}
