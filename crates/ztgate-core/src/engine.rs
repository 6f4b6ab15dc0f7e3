//! Per-identity access decisions.
//!
//! Evaluation is fail-closed: an identity without a rule set, a target that
//! does not parse, or a target no rule matches is denied. Rules are walked
//! in ascending priority and the first match decides.

use crate::rules::{RuleAction, RuleKind};
use crate::store::PolicyStore;
use crate::target::Target;
use std::fmt;
use std::sync::Arc;

/// The rule that decided a check, for audit logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedRule {
    pub kind: RuleKind,
    pub pattern: String,
    pub priority: i64,
    pub action: RuleAction,
}

/// Why a check ended the way it did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Matched(MatchedRule),
    NoMatch,
    UnknownIdentity,
    InvalidTarget(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub verdict: Verdict,
    /// Store version the decision was taken against.
    pub policy_version: u64,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Matched(r) => write!(
                f,
                "{} rule '{}' (priority {}, {:?})",
                r.kind, r.pattern, r.priority, r.action
            ),
            Verdict::NoMatch => f.write_str("no match"),
            Verdict::UnknownIdentity => f.write_str("no rules for identity"),
            Verdict::InvalidTarget(e) => write!(f, "invalid target: {e}"),
        }
    }
}

/// Read-only evaluator over a shared [`PolicyStore`].
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    store: Arc<PolicyStore>,
}

impl PolicyEngine {
    pub fn new(store: Arc<PolicyStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    /// `true` when `identity` may reach `target`.
    pub fn check(&self, identity: &str, target: &str) -> bool {
        self.evaluate(identity, target).allowed
    }

    /// Full decision including the matched rule.
    pub fn evaluate(&self, identity: &str, target: &str) -> Decision {
        self.evaluate_flow(identity, &[target])
    }

    /// Decide one flow described by several target forms (for example
    /// `host:port` plus its 5-tuple). Rules are still walked once in
    /// priority order; the first rule matching any form decides. Any form
    /// that fails to parse denies the flow.
    pub fn evaluate_flow(&self, identity: &str, targets: &[&str]) -> Decision {
        let snapshot = self.store.snapshot();
        let policy_version = snapshot.version();
        let deny = |verdict| Decision {
            allowed: false,
            verdict,
            policy_version,
        };

        let Some(rule_set) = snapshot.get(identity) else {
            return deny(Verdict::UnknownIdentity);
        };

        let mut parsed = Vec::with_capacity(targets.len());
        for target in targets {
            match Target::parse(target) {
                Ok(t) => parsed.push(t),
                Err(e) => return deny(Verdict::InvalidTarget(e)),
            }
        }

        match rule_set.first_match_any(&parsed) {
            Some(rule) => Decision {
                allowed: rule.action == RuleAction::Allow,
                verdict: Verdict::Matched(MatchedRule {
                    kind: rule.kind,
                    pattern: rule.pattern.clone(),
                    priority: rule.priority,
                    action: rule.action,
                }),
                policy_version,
            },
            None => deny(Verdict::NoMatch),
        }
    }

    /// The first of `targets` a deny rule matches, checked one by one. A
    /// target no rule matches passes here, so this only narrows a flow
    /// already allowed by [`PolicyEngine::evaluate_flow`].
    pub fn explicit_deny(&self, identity: &str, targets: &[&str]) -> Option<Decision> {
        targets
            .iter()
            .map(|target| self.evaluate(identity, target))
            .find(|d| matches!(&d.verdict, Verdict::Matched(r) if r.action == RuleAction::Deny))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{PatternRule, RuleSet, RuleSetDoc, RuleTable};
    use std::collections::HashMap;
    use std::time::SystemTime;

    fn engine_with(json: &str) -> PolicyEngine {
        let table: RuleTable = serde_json::from_str(json).unwrap();
        let store = Arc::new(PolicyStore::new());
        store.replace_all(table.compile(SystemTime::now()));
        PolicyEngine::new(store)
    }

    fn domain(pattern: &str, priority: i64, action: RuleAction) -> PatternRule {
        PatternRule {
            pattern: pattern.into(),
            priority,
            action,
        }
    }

    #[test]
    fn scenario_deny_before_allow() {
        let engine = engine_with(
            r#"{"rules": {"u1": {"domains": [
                {"pattern": "*.bad.com", "priority": 5, "action": "deny"},
                {"pattern": "*.example.com", "priority": 10, "action": "allow"}
            ]}}}"#,
        );
        assert!(engine.check("u1", "sub.example.com"));
        assert!(!engine.check("u1", "x.bad.com"));
        assert!(!engine.check("u1", "other.com"));
    }

    #[test]
    fn lower_priority_number_wins_regardless_of_insertion_order() {
        for flipped in [false, true] {
            let mut rules = vec![
                domain("*.example.com", 1, RuleAction::Deny),
                domain("sub.example.com", 2, RuleAction::Allow),
            ];
            if flipped {
                rules.reverse();
            }
            let doc = RuleSetDoc {
                domains: rules,
                ..Default::default()
            };
            let store = Arc::new(PolicyStore::new());
            let mut map = HashMap::new();
            map.insert("u1".to_string(), RuleSet::compile(&doc, SystemTime::now()).0);
            store.replace_all(map);

            let decision = PolicyEngine::new(store).evaluate("u1", "sub.example.com");
            assert!(!decision.allowed, "flipped={flipped}");
            match decision.verdict {
                Verdict::Matched(r) => assert_eq!(r.priority, 1),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn first_match_across_categories() {
        let engine = engine_with(
            r#"{"rules": {"u1": {
                "cidrs": [{"pattern": "10.0.0.0/8", "priority": 20, "action": "allow"}],
                "ips": [{"pattern": "10.9.9.9", "priority": 3, "action": "deny"}]
            }}}"#,
        );
        assert!(engine.check("u1", "10.1.2.3:443"));
        assert!(!engine.check("u1", "10.9.9.9:443"));
        assert!(!engine.check("u1", "11.0.0.0"));
    }

    #[test]
    fn unknown_identity_denied() {
        let engine = engine_with(
            r#"{"rules": {"u1": {"domains": [{"pattern": "*", "priority": 1, "action": "allow"}]}}}"#,
        );
        assert!(engine.check("u1", "anything.com"));
        let d = engine.evaluate("ghost", "anything.com");
        assert!(!d.allowed);
        assert_eq!(d.verdict, Verdict::UnknownIdentity);
    }

    #[test]
    fn empty_rule_set_denied() {
        let engine = engine_with(r#"{"rules": {"u1": {}}}"#);
        for target in ["example.com", "10.0.0.1", "tcp:1.1.1.1:1->2.2.2.2:2:outbound"] {
            let d = engine.evaluate("u1", target);
            assert!(!d.allowed);
            assert_eq!(d.verdict, Verdict::NoMatch);
        }
    }

    #[test]
    fn empty_store_denies() {
        let engine = PolicyEngine::new(Arc::new(PolicyStore::new()));
        assert!(!engine.check("u1", "example.com"));
    }

    #[test]
    fn unparsable_deny_rule_does_not_open_lower_allow() {
        let engine = engine_with(
            r#"{"rules": {"u1": {
                "cidrs": [{"pattern": "10.0.0.0/33", "priority": 1, "action": "deny"}],
                "domains": [{"pattern": "*", "priority": 10, "action": "allow"}]
            }}}"#,
        );
        let decision = engine.evaluate("u1", "10.1.2.3");
        assert!(!decision.allowed);
        assert!(matches!(decision.verdict, Verdict::NoMatch));
        assert!(!engine.check("u1", "example.com"));
    }

    #[test]
    fn explicit_deny_ignores_unmatched_targets() {
        let engine = engine_with(
            r#"{"rules": {"u1": {
                "ips": [{"pattern": "10.9.9.9", "priority": 1, "action": "deny"}],
                "domains": [{"pattern": "svc.internal", "priority": 5, "action": "allow"}]
            }}}"#,
        );
        assert!(engine.explicit_deny("u1", &["10.1.1.1:443", "[2001:db8::1]:443"]).is_none());

        let d = engine.explicit_deny("u1", &["10.1.1.1:443", "10.9.9.9:443"]).unwrap();
        assert!(!d.allowed);
        assert!(matches!(d.verdict, Verdict::Matched(ref r) if r.pattern == "10.9.9.9"));
        assert!(engine.explicit_deny("ghost", &["10.9.9.9:443"]).is_none());
    }

    #[test]
    fn invalid_target_denied() {
        let engine = engine_with(
            r#"{"rules": {"u1": {"domains": [{"pattern": "*", "priority": 1, "action": "allow"}]}}}"#,
        );
        let d = engine.evaluate("u1", "tcp:bogus->tuple");
        assert!(!d.allowed);
        assert!(matches!(d.verdict, Verdict::InvalidTarget(_)));
    }

    #[test]
    fn flow_forms_share_one_priority_walk() {
        let engine = engine_with(
            r#"{"rules": {"u1": {
                "domains": [{"pattern": "*", "priority": 10, "action": "allow"}],
                "protocols": [{"protocol": "tcp", "dst_port": 22, "priority": 1, "action": "deny"}]
            }}}"#,
        );
        let ssh = ["10.0.0.5:22", "tcp:10.200.0.2:40000->10.0.0.5:22:outbound"];
        let d = engine.evaluate_flow("u1", &ssh);
        assert!(!d.allowed);
        assert!(matches!(d.verdict, Verdict::Matched(ref r) if r.kind == RuleKind::Protocol));

        let https = ["10.0.0.5:443", "tcp:10.200.0.2:40000->10.0.0.5:443:outbound"];
        assert!(engine.evaluate_flow("u1", &https).allowed);
    }

    #[test]
    fn protocol_rules() {
        let engine = engine_with(
            r#"{"rules": {"u1": {"protocols": [
                {"protocol": "tcp", "dst_port": "22", "priority": 1, "action": "deny"},
                {"protocol": "tcp", "dst_ip": "192.168.0.0/16", "dst_port": "1-1024",
                 "direction": "outbound", "priority": 2, "action": "allow"}
            ]}}}"#,
        );
        assert!(!engine.check("u1", "tcp:10.200.0.2:50000->192.168.1.5:22:outbound"));
        assert!(engine.check("u1", "tcp:10.200.0.2:50000->192.168.1.5:443:outbound"));
        assert!(!engine.check("u1", "tcp:10.200.0.2:50000->192.168.1.5:443:inbound"));
        assert!(!engine.check("u1", "udp:10.200.0.2:50000->192.168.1.5:53:outbound"));
    }
}
