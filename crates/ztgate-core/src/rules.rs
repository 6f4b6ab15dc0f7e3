//! Rule-distribution document and compiled, immutable rule sets.
//!
//! The management service publishes one document covering every identity:
//!
//! ```json
//! {
//!   "rules": {
//!     "u1": {
//!       "domains":   [{"pattern": "*.example.com", "priority": 10, "action": "allow"}],
//!       "protocols": [{"protocol": "tcp", "dst_port": "22", "priority": 1, "action": "deny"}]
//!     }
//!   },
//!   "count": 1,
//!   "timestamp": "2026-01-01T00:00:00Z"
//! }
//! ```
//!
//! A [`RuleSet`] is compiled once from its document section and never
//! changes afterwards; a refresh builds a fresh one.

use crate::pattern::{AddressMatch, Matcher, TupleMatcher};
use crate::target::Target;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Deny,
}

impl Default for RuleAction {
    fn default() -> Self {
        RuleAction::Deny
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Domain,
    Ip,
    Cidr,
    Url,
    Protocol,
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RuleKind::Domain => "domain",
            RuleKind::Ip => "ip",
            RuleKind::Cidr => "cidr",
            RuleKind::Url => "url",
            RuleKind::Protocol => "protocol",
        })
    }
}

/// Domain, IP, CIDR and URL entries share this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternRule {
    pub pattern: String,
    #[serde(default)]
    pub priority: i64,
    pub action: RuleAction,
}

/// Ports arrive either as JSON numbers or as spec strings (`"80,443"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortValue {
    Number(u16),
    Text(String),
}

impl PortValue {
    fn as_spec(&self) -> String {
        match self {
            PortValue::Number(n) => n.to_string(),
            PortValue::Text(s) => s.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtocolRule {
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub src_ip: Option<String>,
    #[serde(default)]
    pub dst_ip: Option<String>,
    #[serde(default)]
    pub src_port: Option<PortValue>,
    #[serde(default)]
    pub dst_port: Option<PortValue>,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub priority: i64,
    pub action: RuleAction,
}

/// One identity's section of the rule document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSetDoc {
    #[serde(default)]
    pub domains: Vec<PatternRule>,
    #[serde(default)]
    pub ips: Vec<PatternRule>,
    #[serde(default)]
    pub cidrs: Vec<PatternRule>,
    #[serde(default)]
    pub urls: Vec<PatternRule>,
    #[serde(default)]
    pub protocols: Vec<ProtocolRule>,
}

/// The full rule-distribution document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleTable {
    #[serde(default)]
    pub rules: HashMap<String, RuleSetDoc>,
    #[serde(default)]
    pub count: Option<usize>,
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
}

impl RuleTable {
    /// Compile every identity's section. An identity with any entry that
    /// fails to compile gets an empty set, so every flow it makes is denied;
    /// other identities are unaffected.
    pub fn compile(&self, fetched_at: SystemTime) -> HashMap<String, RuleSet> {
        if let Some(count) = self.count {
            if count != self.rules.len() {
                warn!(
                    declared = count,
                    actual = self.rules.len(),
                    "rule document count does not match its contents"
                );
            }
        }

        self.rules
            .iter()
            .map(|(identity, doc)| {
                let (set, errors) = RuleSet::compile(doc, fetched_at);
                if errors.is_empty() {
                    return (identity.clone(), set);
                }
                for e in &errors {
                    warn!(identity = %identity, error = %e, "invalid rule");
                }
                warn!(
                    identity = %identity,
                    invalid = errors.len(),
                    "rule set rejected, denying all flows for identity"
                );
                (identity.clone(), RuleSet::from_rules(Vec::new(), fetched_at))
            })
            .collect()
    }
}

/// One compiled firewall directive.
#[derive(Debug, Clone)]
pub struct Rule {
    pub kind: RuleKind,
    /// Human-readable form of the pattern, used in audit logs.
    pub pattern: String,
    pub priority: i64,
    pub action: RuleAction,
    matcher: Matcher,
}

impl Rule {
    pub fn new(kind: RuleKind, pattern: String, priority: i64, action: RuleAction, matcher: Matcher) -> Self {
        Self {
            kind,
            pattern,
            priority,
            action,
            matcher,
        }
    }

    pub fn matches(&self, target: &Target) -> bool {
        self.matcher.matches(target)
    }
}

/// The rules for exactly one identity, sorted for evaluation.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<Rule>,
    fetched_at: SystemTime,
}

impl RuleSet {
    /// Build from already-compiled rules. The list is stable-sorted by
    /// ascending priority, so equal priorities keep their given order.
    pub fn from_rules(mut rules: Vec<Rule>, fetched_at: SystemTime) -> Self {
        rules.sort_by_key(|r| r.priority);
        Self { rules, fetched_at }
    }

    /// Merge all categories (domains, ips, cidrs, urls, protocols, in that
    /// order) and sort. Returns the set plus a description of every entry
    /// that failed to compile.
    pub fn compile(doc: &RuleSetDoc, fetched_at: SystemTime) -> (Self, Vec<String>) {
        let mut rules = Vec::new();
        let mut errors = Vec::new();

        let categories: [(RuleKind, &Vec<PatternRule>, fn(&str) -> Result<Matcher, String>); 4] = [
            (RuleKind::Domain, &doc.domains, Matcher::domain),
            (RuleKind::Ip, &doc.ips, Matcher::ip),
            (RuleKind::Cidr, &doc.cidrs, Matcher::cidr),
            (RuleKind::Url, &doc.urls, Matcher::url),
        ];

        for (kind, entries, build) in categories {
            for entry in entries {
                match build(&entry.pattern) {
                    Ok(matcher) => rules.push(Rule::new(
                        kind,
                        entry.pattern.clone(),
                        entry.priority,
                        entry.action,
                        matcher,
                    )),
                    Err(e) => errors.push(format!("{kind} rule: {e}")),
                }
            }
        }

        for entry in &doc.protocols {
            match compile_protocol(entry) {
                Ok(matcher) => rules.push(Rule::new(
                    RuleKind::Protocol,
                    describe_protocol(entry),
                    entry.priority,
                    entry.action,
                    Matcher::Tuple(matcher),
                )),
                Err(e) => errors.push(format!("protocol rule: {e}")),
            }
        }

        (Self::from_rules(rules, fetched_at), errors)
    }

    /// First rule in priority order matching `target`.
    pub fn first_match(&self, target: &Target) -> Option<&Rule> {
        self.rules.iter().find(|r| r.matches(target))
    }

    /// First rule in priority order matching any of `targets`. Lets one
    /// flow be described both by address and by 5-tuple without breaking
    /// the priority order across rule kinds.
    pub fn first_match_any(&self, targets: &[Target]) -> Option<&Rule> {
        self.rules
            .iter()
            .find(|r| targets.iter().any(|t| r.matches(t)))
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn fetched_at(&self) -> SystemTime {
        self.fetched_at
    }
}

/// Empty strings and `any`/`*` count as unset.
fn populated(field: &Option<String>) -> Option<&str> {
    field
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "*" && !s.eq_ignore_ascii_case("any"))
}

fn compile_protocol(entry: &ProtocolRule) -> Result<TupleMatcher, String> {
    let src_port = entry.src_port.as_ref().map(PortValue::as_spec);
    let dst_port = entry.dst_port.as_ref().map(PortValue::as_spec);

    Ok(TupleMatcher {
        protocol: populated(&entry.protocol).map(str::to_ascii_lowercase),
        src_ip: populated(&entry.src_ip).map(AddressMatch::parse).transpose()?,
        dst_ip: populated(&entry.dst_ip).map(AddressMatch::parse).transpose()?,
        src_port: populated(&src_port).map(str::parse).transpose()?,
        dst_port: populated(&dst_port).map(str::parse).transpose()?,
        direction: populated(&entry.direction).map(str::parse).transpose()?,
    })
}

fn describe_protocol(entry: &ProtocolRule) -> String {
    let field = |v: Option<String>| v.unwrap_or_else(|| "*".to_string());
    format!(
        "{}:{}:{}->{}:{}:{}",
        field(entry.protocol.clone()),
        field(entry.src_ip.clone()),
        field(entry.src_port.as_ref().map(PortValue::as_spec)),
        field(entry.dst_ip.clone()),
        field(entry.dst_port.as_ref().map(PortValue::as_spec)),
        field(entry.direction.clone()),
    )
}
