//! Standing approval rules.
//!
//! A rule pre-approves matching tool calls. High and critical risk tiers
//! must be constrained (at least one exact or pattern constraint) and
//! bounded (`expires_at` or `max_uses`); an unconstrained blanket rule is
//! only legal for low and medium tiers.

use butlers_storage::RiskTier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ApprovalError, ApprovalResult};

/// Identifier for one standing rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub Uuid);

impl RuleId {
    /// Mint a fresh rule id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RuleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One argument constraint on a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleConstraint {
    /// The named argument must equal this string exactly.
    Exact {
        /// Argument name.
        arg: String,
        /// Required value.
        value: String,
    },
    /// The named argument must match a glob-lite pattern (`*` wildcard).
    Pattern {
        /// Argument name.
        arg: String,
        /// Pattern with `*` wildcards.
        pattern: String,
    },
}

impl RuleConstraint {
    /// Specificity weight for precedence sorting. Exact beats pattern.
    #[must_use]
    pub const fn specificity(&self) -> u32 {
        match self {
            Self::Exact { .. } => 2,
            Self::Pattern { .. } => 1,
        }
    }

    fn matches(&self, args: &Value) -> bool {
        let (arg, check): (&str, Box<dyn Fn(&str) -> bool + '_>) = match self {
            Self::Exact { arg, value } => {
                (arg.as_str(), Box::new(move |v: &str| v == value.as_str()))
            },
            Self::Pattern { arg, pattern } => {
                (arg.as_str(), Box::new(move |v: &str| glob_match(pattern, v)))
            },
        };
        args.get(arg)
            .map(|v| match v {
                Value::String(s) => check(s),
                other => check(&other.to_string()),
            })
            .unwrap_or(false)
    }
}

/// Glob-lite matching: `*` matches any run of characters.
fn glob_match(pattern: &str, value: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == value;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !value.starts_with(first) {
        return false;
    }
    let Some(tail) = value.get(first.len()..) else {
        return false;
    };
    let Some(mut rest) = tail.len().checked_sub(last.len()).and_then(|end| tail.get(..end)) else {
        return false;
    };
    if !tail.ends_with(last) {
        return false;
    }

    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    true
}

/// One standing rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandingRule {
    /// Rule id.
    pub rule_id: RuleId,
    /// Gated tool this rule covers.
    pub tool_name: String,
    /// Argument constraints; all must match.
    pub constraints: Vec<RuleConstraint>,
    /// Expiry bound.
    pub expires_at: Option<DateTime<Utc>>,
    /// Use-count bound.
    pub max_uses: Option<u32>,
    /// Uses consumed so far.
    pub uses: u32,
    /// When the rule was created.
    pub created_at: DateTime<Utc>,
}

impl StandingRule {
    /// Validate the rule against a risk tier.
    ///
    /// # Errors
    ///
    /// High and critical tiers require at least one constraint and a
    /// bounded scope.
    pub fn validate_for_tier(&self, tier: RiskTier) -> ApprovalResult<()> {
        if tier < RiskTier::High {
            return Ok(());
        }
        if self.constraints.is_empty() {
            return Err(ApprovalError::InvalidRule(format!(
                "{tier:?}-tier rule for '{}' needs at least one exact or pattern constraint",
                self.tool_name
            )));
        }
        if self.expires_at.is_none() && self.max_uses.is_none() {
            return Err(ApprovalError::InvalidRule(format!(
                "{tier:?}-tier rule for '{}' needs a bounded scope (expires_at or max_uses)",
                self.tool_name
            )));
        }
        Ok(())
    }

    /// Whether the rule covers this call right now.
    #[must_use]
    pub fn matches(&self, tool_name: &str, args: &Value, now: DateTime<Utc>) -> bool {
        if self.tool_name != tool_name {
            return false;
        }
        if self.expires_at.is_some_and(|deadline| deadline <= now) {
            return false;
        }
        if self.max_uses.is_some_and(|max| self.uses >= max) {
            return false;
        }
        self.constraints.iter().all(|c| c.matches(args))
    }

    /// Total specificity across constraints.
    #[must_use]
    pub fn specificity(&self) -> u32 {
        self.constraints.iter().map(RuleConstraint::specificity).sum()
    }

    /// Whether the rule carries any scope bound.
    #[must_use]
    pub const fn is_bounded(&self) -> bool {
        self.expires_at.is_some() || self.max_uses.is_some()
    }
}

/// The standing rules for one butler.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<StandingRule>,
}

impl RuleSet {
    /// Create an empty rule set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule after tier validation.
    ///
    /// # Errors
    ///
    /// See [`StandingRule::validate_for_tier`].
    pub fn add(&mut self, rule: StandingRule, tier: RiskTier) -> ApprovalResult<RuleId> {
        rule.validate_for_tier(tier)?;
        let id = rule.rule_id;
        self.rules.push(rule);
        Ok(id)
    }

    /// Remove a rule.
    pub fn remove(&mut self, rule_id: RuleId) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.rule_id != rule_id);
        self.rules.len() != before
    }

    /// Find the best matching rule and consume one use.
    ///
    /// Precedence: constraint specificity desc, bounded scope desc,
    /// created_at desc, rule_id asc.
    pub fn find_match_and_consume(
        &mut self,
        tool_name: &str,
        args: &Value,
        now: DateTime<Utc>,
    ) -> Option<RuleId> {
        let mut candidates: Vec<&mut StandingRule> = self
            .rules
            .iter_mut()
            .filter(|r| r.matches(tool_name, args, now))
            .collect();
        candidates.sort_by(|a, b| {
            b.specificity()
                .cmp(&a.specificity())
                .then(b.is_bounded().cmp(&a.is_bounded()))
                .then(b.created_at.cmp(&a.created_at))
                .then(a.rule_id.cmp(&b.rule_id))
        });
        let winner = candidates.into_iter().next()?;
        winner.uses = winner.uses.saturating_add(1);
        Some(winner.rule_id)
    }

    /// Number of rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
