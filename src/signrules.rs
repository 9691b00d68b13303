//! Sign-rules engine (C11, spec §4.9): rule store, matching, "should be
//! signed" computation, auto-add. New module; wildcard/domain matching
//! grounded on the address/domain-matching idioms used throughout the pack
//! (e.g. policy-domain handling in `mta-sts`-style crates).

use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleSource {
    Default,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    All,
    Neutral,
    HideFail,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub id: u64,
    pub source: RuleSource,
    pub domain: Option<String>,
    pub list_id: Option<String>,
    pub addr_pattern: String,
    pub sdid_pattern: String,
    pub kind: RuleKind,
    pub priority: i32,
    pub enabled: bool,
}

impl Rule {
    fn matches(&self, from_domain: &str, from_address: &str, list_id: Option<&str>) -> bool {
        if !self.enabled {
            return false;
        }
        if let Some(domain) = &self.domain {
            if !domain.is_empty() && !domain.eq_ignore_ascii_case(from_domain) {
                return false;
            }
        }
        if let Some(pattern) = &self.list_id {
            if !pattern.is_empty() && !wildcard_match(pattern, list_id.unwrap_or(""), true) {
                return false;
            }
        }
        wildcard_match(&self.addr_pattern, from_address, false)
    }
}

fn wildcard_match(pattern: &str, value: &str, case_sensitive: bool) -> bool {
    if pattern == "*" {
        return true;
    }
    let (pattern, value) = if case_sensitive {
        (pattern.to_string(), value.to_string())
    } else {
        (pattern.to_lowercase(), value.to_lowercase())
    };
    match (pattern.strip_prefix('*'), pattern.strip_suffix('*')) {
        _ if pattern.starts_with('*') && pattern.ends_with('*') && pattern.len() >= 2 => {
            value.contains(&pattern[1..pattern.len() - 1])
        }
        (Some(suffix), _) => value.ends_with(suffix),
        (None, Some(prefix)) => value.starts_with(prefix),
        _ => value == pattern,
    }
}

/// "Should be signed by" outcome for one matching message (spec §4.9).
#[derive(Debug, Default)]
pub struct RuleVerdict {
    /// SDIDs a valid signature must come from.
    pub required_sdids: HashSet<String>,
    /// SDIDs for which a failing signature should be demoted to
    /// `PermFailNoSig` rather than reported as a hard failure.
    pub hidefail_sdids: HashSet<String>,
}

pub struct RuleStore {
    default_rules: Vec<Rule>,
    user_rules: Vec<Rule>,
    next_id: u64,
}

impl RuleStore {
    pub fn new(default_rules: Vec<Rule>) -> Self {
        let next_id = default_rules.iter().map(|r| r.id).max().unwrap_or(0) + 1;
        Self {
            default_rules,
            user_rules: Vec::new(),
            next_id,
        }
    }

    pub fn list_rules(&self, source: RuleSource) -> &[Rule] {
        match source {
            RuleSource::Default => &self.default_rules,
            RuleSource::User => &self.user_rules,
        }
    }

    pub fn add_rule(&mut self, mut rule: Rule) -> u64 {
        rule.id = self.next_id;
        self.next_id += 1;
        rule.source = RuleSource::User;
        self.user_rules.push(rule);
        self.next_id - 1
    }

    pub fn delete_rules(&mut self, ids: &[u64]) {
        self.user_rules.retain(|r| !ids.contains(&r.id));
    }

    pub fn update_rule(&mut self, id: u64, enabled: bool, priority: i32) {
        if let Some(rule) = self.user_rules.iter_mut().find(|r| r.id == id) {
            rule.enabled = enabled;
            rule.priority = priority;
        }
    }

    /// Computes the "should be signed" verdict for a message, applying
    /// rules in decreasing priority: the highest-priority matching rule per
    /// sdid determines that sdid's expected outcome.
    pub fn evaluate(
        &self,
        from_domain: &str,
        from_address: &str,
        list_id: Option<&str>,
    ) -> RuleVerdict {
        let mut matching: Vec<&Rule> = self
            .default_rules
            .iter()
            .chain(self.user_rules.iter())
            .filter(|r| r.matches(from_domain, from_address, list_id))
            .collect();
        matching.sort_by_key(|r| std::cmp::Reverse(r.priority));

        let mut decided: std::collections::HashMap<&str, RuleKind> = std::collections::HashMap::new();
        for rule in matching {
            decided.entry(rule.sdid_pattern.as_str()).or_insert(rule.kind);
        }

        let mut verdict = RuleVerdict::default();
        for (sdid, kind) in decided {
            match kind {
                RuleKind::All => {
                    verdict.required_sdids.insert(sdid.to_string());
                }
                RuleKind::HideFail => {
                    verdict.hidefail_sdids.insert(sdid.to_string());
                }
                RuleKind::Neutral => {}
            }
        }
        verdict
    }

    /// Whether a user rule already covers `sdid`, used to scope `auto_add`
    /// to a first-time successful verification (spec §4.9): repeated
    /// verification of the same sender must not append duplicate rules.
    pub fn has_user_rule_for_sdid(&self, sdid: &str) -> bool {
        self.user_rules.iter().any(|r| r.sdid_pattern == sdid)
    }

    /// Auto-add a user rule after a first-time successful verification,
    /// scoped per `policy.signRules.autoAddRule.for` (spec §6).
    pub fn auto_add(&mut self, sdid: &str, scope: AutoAddScope, from_address: &str) -> u64 {
        let addr_pattern = match scope {
            AutoAddScope::Address => from_address.to_string(),
            AutoAddScope::Subdomain => format!("*@{}", sdid),
            AutoAddScope::BaseDomain => format!("*@*.{}", base_domain(sdid)),
        };
        self.add_rule(Rule {
            id: 0,
            source: RuleSource::User,
            domain: None,
            list_id: None,
            addr_pattern,
            sdid_pattern: sdid.to_string(),
            kind: RuleKind::All,
            // user-inserted rules sit at a mid priority, per DESIGN NOTES
            // (default rules at high values, user-neutral at low).
            priority: 500,
            enabled: true,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AutoAddScope {
    Address,
    Subdomain,
    BaseDomain,
}

fn base_domain(sdid: &str) -> String {
    let parts: Vec<&str> = sdid.split('.').collect();
    if parts.len() <= 2 {
        sdid.to_string()
    } else {
        parts[parts.len() - 2..].join(".")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(addr: &str, sdid: &str, kind: RuleKind, priority: i32) -> Rule {
        Rule {
            id: 0,
            source: RuleSource::Default,
            domain: None,
            list_id: None,
            addr_pattern: addr.to_string(),
            sdid_pattern: sdid.to_string(),
            kind,
            priority,
            enabled: true,
        }
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("*@example.com", "user@example.com", false));
        assert!(!wildcard_match("*@example.com", "user@evil.com", false));
        assert!(wildcard_match("*", "anything", false));
    }

    #[test]
    fn test_should_be_signed() {
        let mut store = RuleStore::new(vec![rule("*@example.com", "example.com", RuleKind::All, 100)]);
        let verdict = store.evaluate("example.com", "user@example.com", None);
        assert!(verdict.required_sdids.contains("example.com"));

        store.add_rule(rule("*@example.com", "example.com", RuleKind::Neutral, 900));
        let verdict = store.evaluate("example.com", "user@example.com", None);
        assert!(verdict.required_sdids.is_empty());
    }

    #[test]
    fn test_auto_add_subdomain_scope() {
        let mut store = RuleStore::new(vec![]);
        store.auto_add("example.com", AutoAddScope::Subdomain, "user@example.com");
        let rules = store.list_rules(RuleSource::User);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].addr_pattern, "*@example.com");
    }

    #[test]
    fn test_has_user_rule_for_sdid_guards_repeat_auto_add() {
        let mut store = RuleStore::new(vec![]);
        assert!(!store.has_user_rule_for_sdid("example.com"));
        store.auto_add("example.com", AutoAddScope::Address, "user@example.com");
        assert!(store.has_user_rule_for_sdid("example.com"));
        assert_eq!(store.list_rules(RuleSource::User).len(), 1);
    }
}
