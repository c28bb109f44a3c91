// Tier capability flags
//
// The same binary serves three deployment tiers; callers discover what the
// running instance supports via GetCapabilities rather than probing.

use serde::{Deserialize, Serialize};

use crate::error::SpineError;

/// Deployment tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Inline (sync) execution only, no scheduler
    #[default]
    Basic,
    /// Pooled workers, no scheduler
    Intermediate,
    /// Pooled workers + scheduler
    Full,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Basic => "basic",
            Tier::Intermediate => "intermediate",
            Tier::Full => "full",
        }
    }
}

impl std::str::FromStr for Tier {
    type Err = SpineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "basic" => Ok(Tier::Basic),
            "intermediate" => Ok(Tier::Intermediate),
            "full" => Ok(Tier::Full),
            other => Err(SpineError::Config(format!("unknown tier: {other}"))),
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Feature flags advertised by a running instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct Capabilities {
    pub tier: Tier,
    /// Submissions return immediately; a worker pool drives execution
    pub async_execution: bool,
    /// History-window quality gates available
    pub history: bool,
    /// Cron/interval scheduler running
    pub scheduling: bool,
    /// User-level authentication (never in core scope)
    pub auth: bool,
}

impl Capabilities {
    pub fn for_tier(tier: Tier) -> Self {
        match tier {
            Tier::Basic => Self {
                tier,
                async_execution: false,
                history: true,
                scheduling: false,
                auth: false,
            },
            Tier::Intermediate => Self {
                tier,
                async_execution: true,
                history: true,
                scheduling: false,
                auth: false,
            },
            Tier::Full => Self {
                tier,
                async_execution: true,
                history: true,
                scheduling: true,
                auth: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_tier_is_sync_only() {
        let caps = Capabilities::for_tier(Tier::Basic);
        assert!(!caps.async_execution);
        assert!(!caps.scheduling);
    }

    #[test]
    fn test_full_tier_has_everything_but_auth() {
        let caps = Capabilities::for_tier(Tier::Full);
        assert!(caps.async_execution);
        assert!(caps.scheduling);
        assert!(!caps.auth);
    }

    #[test]
    fn test_tier_parse() {
        assert_eq!("full".parse::<Tier>().unwrap(), Tier::Full);
        assert!("mega".parse::<Tier>().is_err());
    }
}
