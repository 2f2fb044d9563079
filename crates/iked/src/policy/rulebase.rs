//! Ordered rule collections
//!
//! One rulebase is loaded from configuration and shared. Every Phase-1
//! session starts from its own clone and only ever removes rules from it,
//! so a negotiation's candidate set shrinks monotonically and the shared
//! original is never touched.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::debug;

use super::addr::address_match;
use super::ident::{psk_identities_compatible, Identity};
use super::rule::{ExchangeMode, Phase1Proposal, Rule};
use crate::logging::log_rule_selected;

/// What a new session knows when it goes looking for a rule
#[derive(Debug, Clone, Copy)]
pub struct RuleQuery<'a> {
    /// Local endpoint
    pub local: &'a SocketAddr,
    /// Remote endpoint
    pub remote: &'a SocketAddr,
    /// Key-manager cookie; 0 is treated as absent
    pub cookie: Option<u32>,
    /// Local identity from the kernel, if any
    pub local_id: Option<&'a Identity>,
    /// Remote identity from the kernel, if any
    pub remote_id: Option<&'a Identity>,
}

impl<'a> RuleQuery<'a> {
    /// Query on endpoints alone
    pub fn new(local: &'a SocketAddr, remote: &'a SocketAddr) -> Self {
        Self {
            local,
            remote,
            cookie: None,
            local_id: None,
            remote_id: None,
        }
    }
}

/// An ordered sequence of shared rules; first match wins
#[derive(Debug, Clone, Default)]
pub struct Rulebase {
    rules: Vec<Arc<Rule>>,
}

impl Rulebase {
    /// Empty rulebase
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule
    pub fn push(&mut self, rule: Rule) {
        self.rules.push(Arc::new(rule));
    }

    /// Number of live rules
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether no rules remain
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules in order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Rule>> {
        self.rules.iter()
    }

    /// Rule at `index`
    pub fn get(&self, index: usize) -> Option<&Arc<Rule>> {
        self.rules.get(index)
    }

    /// Rule by label
    pub fn find_by_label(&self, label: &str) -> Option<&Arc<Rule>> {
        self.rules.iter().find(|r| r.label == label)
    }

    /// Rule by key-manager cookie
    pub fn find_by_cookie(&self, cookie: u32) -> Option<&Arc<Rule>> {
        self.rules.iter().find(|r| r.cookie == cookie)
    }

    /// Remove the rule at `index` unless `keep`
    ///
    /// Returns how far a forward walk should advance: 0 after a removal (the
    /// next rule slid into `index`), 1 otherwise.
    pub fn prune_or_keep(&mut self, index: usize, keep: bool) -> usize {
        if keep || index >= self.rules.len() {
            return 1;
        }
        let removed = self.rules.remove(index);
        debug!(rule = %removed.label, "Rule pruned from candidate set");
        0
    }

    /// Walk the rules in order, removing every one `keep` rejects
    fn prune_where(&mut self, mut keep: impl FnMut(&Rule) -> bool) -> usize {
        let before = self.rules.len();
        let mut index = 0;
        while index < self.rules.len() {
            let verdict = keep(&self.rules[index]);
            index += self.prune_or_keep(index, verdict);
        }
        before - self.rules.len()
    }

    /// Select the rule for a new session, pruning rules that cannot apply
    ///
    /// A rule survives if both endpoints fall within its address specs and,
    /// when the kernel supplied both identities and the rule authenticates
    /// with a pre-shared key, both identities are address-typed. With a
    /// cookie the survivor carrying that cookie is chosen; otherwise the
    /// first survivor is.
    pub fn select_rule(&mut self, query: &RuleQuery<'_>) -> Option<Arc<Rule>> {
        let ids_present = query.local_id.is_some() && query.remote_id.is_some();
        let pruned = self.prune_where(|rule| {
            address_match(query.local, &rule.local_addr)
                && address_match(query.remote, &rule.remote_addr)
                && (!ids_present
                    || !rule.uses_psk()
                    || psk_identities_compatible(query.local_id, query.remote_id))
        });

        let cookie = query.cookie.filter(|&c| c != 0);
        let selected = match cookie {
            Some(c) => self.find_by_cookie(c).cloned(),
            None => self.rules.first().cloned(),
        };
        if let Some(rule) = &selected {
            log_rule_selected(&rule.label, pruned, self.rules.len());
        }
        selected
    }

    /// Prune a responder's candidate set by exchange mode and endpoints
    pub fn prune_for_responder(
        &mut self,
        mode: ExchangeMode,
        local: &SocketAddr,
        remote: &SocketAddr,
    ) -> usize {
        self.prune_where(|rule| {
            rule.mode.admits(mode)
                && address_match(local, &rule.local_addr)
                && address_match(remote, &rule.remote_addr)
        })
    }

    /// Choose one of a peer's Phase-1 proposals
    ///
    /// Rules are walked in order. A rule with no transform accepting any
    /// proposal is pruned; the first rule that accepts one fixes the chosen
    /// proposal, and every later rule that cannot accept that same proposal
    /// is pruned too. Returns the proposal index.
    pub fn select_phase1_proposal(&mut self, proposals: &[Phase1Proposal]) -> Option<usize> {
        let mut chosen: Option<usize> = None;
        self.prune_where(|rule| match chosen {
            None => {
                chosen = proposals
                    .iter()
                    .position(|p| rule.transforms.iter().any(|t| t.accepts(p)));
                chosen.is_some()
            }
            Some(pi) => rule.transforms.iter().any(|t| t.accepts(&proposals[pi])),
        });
        chosen
    }
}

impl FromIterator<Rule> for Rulebase {
    fn from_iter<I: IntoIterator<Item = Rule>>(iter: I) -> Self {
        Self {
            rules: iter.into_iter().map(Arc::new).collect(),
        }
    }
}
