//! Rate limit policy: thresholds, windows and block durations per identity class.

use std::collections::HashMap;
use std::time::Duration;

use super::identity::RateIdentity;
use crate::error::{Result, TurnstileError};

/// Limits applied to one identity or identity class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitRule {
    /// Maximum requests admitted per window
    pub max_requests: u64,
    /// Length of the counting window
    pub window: Duration,
    /// How long the identity is denied once the threshold is exceeded
    pub block_duration: Duration,
}

impl LimitRule {
    fn validate(&self, what: &str) -> Result<()> {
        if self.max_requests == 0 {
            return Err(TurnstileError::Config(format!(
                "{}: max requests per window must be positive",
                what
            )));
        }
        if self.window.is_zero() {
            return Err(TurnstileError::Config(format!(
                "{}: window duration must be positive",
                what
            )));
        }
        if self.block_duration.is_zero() {
            return Err(TurnstileError::Config(format!(
                "{}: block duration must be positive",
                what
            )));
        }
        Ok(())
    }
}

/// Per-token override of the token default rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenOverride {
    /// Maximum requests admitted per window
    pub max_requests: u64,
    /// Window length for this token
    pub window: Duration,
}

/// The immutable policy the decision engine consults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    ip: LimitRule,
    token: LimitRule,
    token_rules: HashMap<String, LimitRule>,
}

impl RateLimitPolicy {
    /// Build and validate a policy.
    ///
    /// Overridden tokens keep the token default block duration.
    pub fn new(
        ip: LimitRule,
        token: LimitRule,
        overrides: HashMap<String, TokenOverride>,
    ) -> Result<Self> {
        ip.validate("ip")?;
        token.validate("token")?;

        let mut token_rules = HashMap::with_capacity(overrides.len());
        for (name, o) in overrides {
            if name.is_empty() {
                return Err(TurnstileError::Config(
                    "token override with empty name".to_string(),
                ));
            }
            let rule = LimitRule {
                max_requests: o.max_requests,
                window: o.window,
                block_duration: token.block_duration,
            };
            rule.validate(&format!("token {:?}", name))?;
            token_rules.insert(name, rule);
        }

        Ok(Self {
            ip,
            token,
            token_rules,
        })
    }

    /// The rule governing `identity`.
    ///
    /// Unknown tokens use the token default, never the IP rule.
    pub fn rule_for(&self, identity: &RateIdentity) -> &LimitRule {
        match identity {
            RateIdentity::Token(token) => self.token_rules.get(token).unwrap_or(&self.token),
            RateIdentity::IpAddress(_) => &self.ip,
        }
    }

    /// The rule for IP identities.
    pub fn ip_rule(&self) -> &LimitRule {
        &self.ip
    }

    /// The default rule for token identities.
    pub fn token_rule(&self) -> &LimitRule {
        &self.token
    }

    /// Number of tokens with an override.
    pub fn override_count(&self) -> usize {
        self.token_rules.len()
    }
}
