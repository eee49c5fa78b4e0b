//! Named scopes composed into one admission decision.

use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::decision::RateLimitDecision;
use crate::error::RateLimitError;
use crate::limiter::RateLimiter;
use crate::quota::Quota;

pub const GLOBAL: &str = "global";
pub const PER_USER: &str = "per_user";
pub const PER_IP: &str = "per_ip";
pub const API_GENERATION: &str = "api_generation";
pub const EXPENSIVE_OPERATIONS: &str = "expensive_operations";

/// Scopes checked for an ordinary inbound request.
pub const REQUEST_SCOPES: [&str; 3] = [GLOBAL, PER_USER, PER_IP];

/// One dimension of quota enforcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// A single counter shared by every caller.
    Global,
    /// Per authenticated user, falling back to the caller's address.
    PerUser,
    /// Per source address.
    PerIp,
    /// Per caller within an operation class (e.g. `generation`, `expensive`).
    Operation(String),
}

/// The caller a check is made on behalf of.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subject {
    pub user: Option<String>,
    pub ip: Option<String>,
}

impl Subject {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self {
            user: Some(id.into()),
            ip: None,
        }
    }

    pub fn ip(addr: impl Into<String>) -> Self {
        Self {
            user: None,
            ip: Some(addr.into()),
        }
    }

    pub fn with_ip(mut self, addr: impl Into<String>) -> Self {
        self.ip = Some(addr.into());
        self
    }

    fn ip_identifier(&self) -> String {
        format!("ip:{}", self.ip.as_deref().unwrap_or("unknown"))
    }

    /// `user:<id>`, or the address identifier for anonymous callers.
    pub fn caller_identifier(&self) -> String {
        match &self.user {
            Some(user) => format!("user:{user}"),
            None => self.ip_identifier(),
        }
    }
}

impl Scope {
    /// Counter identifier for `subject` under this scope.
    pub fn identifier(&self, subject: &Subject) -> String {
        match self {
            Scope::Global => GLOBAL.to_string(),
            Scope::PerUser => subject.caller_identifier(),
            Scope::PerIp => subject.ip_identifier(),
            Scope::Operation(class) => format!("{}:{}", subject.caller_identifier(), class),
        }
    }
}

/// A named scope with its quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeRule {
    pub name: String,
    pub scope: Scope,
    pub quota: Quota,
}

impl ScopeRule {
    pub fn new(name: impl Into<String>, scope: Scope, quota: Quota) -> Self {
        Self {
            name: name.into(),
            scope,
            quota,
        }
    }
}

/// Default quota table.
pub fn default_rules() -> Vec<ScopeRule> {
    vec![
        ScopeRule::new(GLOBAL, Scope::Global, Quota::per_hour(1000)),
        ScopeRule::new(PER_USER, Scope::PerUser, Quota::per_hour(100)),
        ScopeRule::new(PER_IP, Scope::PerIp, Quota::per_hour(200)),
        ScopeRule::new(
            API_GENERATION,
            Scope::Operation("generation".to_string()),
            Quota::per_hour(50),
        ),
        ScopeRule::new(
            EXPENSIVE_OPERATIONS,
            Scope::Operation("expensive".to_string()),
            Quota::per_hour(10),
        ),
    ]
}

/// Decision for one scope of a policy check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeDecision {
    pub scope: String,
    pub identifier: String,
    pub decision: RateLimitDecision,
}

/// Combined decision: denied if any scope denied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub scopes: Vec<ScopeDecision>,
    binding: Option<usize>,
}

impl PolicyDecision {
    /// The denying scope with the longest `retry_after`.
    pub fn binding(&self) -> Option<&ScopeDecision> {
        self.binding.and_then(|i| self.scopes.get(i))
    }

    pub fn retry_after(&self) -> Duration {
        self.binding()
            .map_or(Duration::ZERO, |s| s.decision.retry_after)
    }

    pub fn scope(&self, name: &str) -> Option<&ScopeDecision> {
        self.scopes.iter().find(|s| s.scope == name)
    }

    fn from_scopes(scopes: Vec<ScopeDecision>) -> Self {
        let mut binding: Option<usize> = None;
        for (i, s) in scopes.iter().enumerate() {
            if s.decision.allowed {
                continue;
            }
            let longer = binding
                .map_or(true, |b| s.decision.retry_after > scopes[b].decision.retry_after);
            if longer {
                binding = Some(i);
            }
        }

        Self {
            allowed: binding.is_none(),
            scopes,
            binding,
        }
    }
}

/// A named set of scopes.
///
/// Every requested scope is evaluated (and counted when it admits the call)
/// even if an earlier scope already denied.
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    limiter: RateLimiter,
    rules: Vec<ScopeRule>,
}

impl RateLimitPolicy {
    /// A policy with no scopes.
    pub fn new(limiter: RateLimiter) -> Self {
        Self {
            limiter,
            rules: Vec::new(),
        }
    }

    /// A policy carrying [`default_rules`].
    pub fn with_defaults(limiter: RateLimiter) -> Self {
        let mut policy = Self::new(limiter);
        for rule in default_rules() {
            policy.set_rule(rule);
        }
        policy
    }

    /// Add a scope, replacing any scope with the same name.
    pub fn set_rule(&mut self, rule: ScopeRule) -> &mut Self {
        match self.rules.iter_mut().find(|r| r.name == rule.name) {
            Some(existing) => *existing = rule,
            None => self.rules.push(rule),
        }
        self
    }

    pub fn with_rule(mut self, rule: ScopeRule) -> Self {
        self.set_rule(rule);
        self
    }

    /// Replace only the quota of an existing scope.
    pub fn set_quota(&mut self, name: &str, quota: Quota) -> Result<(), RateLimitError> {
        let rule = self
            .rules
            .iter_mut()
            .find(|r| r.name == name)
            .ok_or_else(|| RateLimitError::UnknownScope(name.to_string()))?;
        rule.quota = quota;
        Ok(())
    }

    pub fn rule(&self, name: &str) -> Option<&ScopeRule> {
        self.rules.iter().find(|r| r.name == name)
    }

    pub fn rules(&self) -> &[ScopeRule] {
        &self.rules
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    fn resolve<'a>(&'a self, scopes: &[&str]) -> Result<Vec<&'a ScopeRule>, RateLimitError> {
        scopes
            .iter()
            .map(|name| {
                self.rule(name)
                    .ok_or_else(|| RateLimitError::UnknownScope((*name).to_string()))
            })
            .collect()
    }

    /// Check (and count) `subject` against the named scopes.
    pub fn check(&self, subject: &Subject, scopes: &[&str]) -> Result<PolicyDecision, RateLimitError> {
        let rules = self.resolve(scopes)?;

        let mut decisions = Vec::with_capacity(rules.len());
        for rule in rules {
            let identifier = rule.scope.identifier(subject);
            let decision = self.limiter.check(&identifier, &rule.quota)?;
            decisions.push(ScopeDecision {
                scope: rule.name.clone(),
                identifier,
                decision,
            });
        }

        let decision = PolicyDecision::from_scopes(decisions);
        if let Some(binding) = decision.binding() {
            info!(
                scope = %binding.scope,
                identifier = %binding.identifier,
                retry_after_ms = binding.decision.retry_after.as_millis() as u64,
                "request rate limited"
            );
        }
        Ok(decision)
    }

    /// Check an ordinary inbound request (global, per-user, per-ip).
    pub fn check_request(&self, subject: &Subject) -> Result<PolicyDecision, RateLimitError> {
        self.check(subject, &REQUEST_SCOPES)
    }

    /// Current standing under the named scopes without counting a call.
    pub fn inspect(&self, subject: &Subject, scopes: &[&str]) -> Result<PolicyDecision, RateLimitError> {
        let rules = self.resolve(scopes)?;

        let mut decisions = Vec::with_capacity(rules.len());
        for rule in rules {
            let identifier = rule.scope.identifier(subject);
            let decision = self.limiter.info(&identifier, &rule.quota)?;
            decisions.push(ScopeDecision {
                scope: rule.name.clone(),
                identifier,
                decision,
            });
        }
        Ok(PolicyDecision::from_scopes(decisions))
    }

    /// Standing under every configured scope.
    pub fn inspect_all(&self, subject: &Subject) -> Result<PolicyDecision, RateLimitError> {
        let names: Vec<&str> = self.rules.iter().map(|r| r.name.as_str()).collect();
        self.inspect(subject, &names)
    }

    /// Administrative override: clear `subject`'s counter for one scope in
    /// the current window.
    pub fn reset(&self, subject: &Subject, scope: &str) -> Result<(), RateLimitError> {
        let rule = self
            .rule(scope)
            .ok_or_else(|| RateLimitError::UnknownScope(scope.to_string()))?;
        let identifier = rule.scope.identifier(subject);
        info!(scope, identifier = %identifier, "rate limit reset");
        self.limiter.reset(&identifier, &rule.quota)
    }
}
