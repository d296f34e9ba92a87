use serde::{Deserialize, Serialize};
use std::fmt;

/// How queued orders reach a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// The sweep job assigns the least-loaded licensed provider.
    RoundRobin,
    /// Providers pull from the available pool themselves, filtered to
    /// states they hold a license in.
    ProviderChoice,
}

impl RoutingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingStrategy::RoundRobin => "round_robin",
            RoutingStrategy::ProviderChoice => "provider_choice",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "round_robin" => Some(RoutingStrategy::RoundRobin),
            "provider_choice" => Some(RoutingStrategy::ProviderChoice),
            _ => None,
        }
    }
}

impl fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-clinic routing switch and strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub clinic_id: i64,
    pub routing_enabled: bool,
    pub strategy: RoutingStrategy,
}

/// Prescriber profile, scoped to a clinic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: i64,
    pub clinic_id: i64,
    pub display_name: String,
    /// Two-letter state codes the provider may prescribe in.
    pub licensed_states: Vec<String>,
}

impl Provider {
    pub fn licensed_in(&self, state: &str) -> bool {
        self.licensed_states.iter().any(|s| s == state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_round_trip() {
        for s in [RoutingStrategy::RoundRobin, RoutingStrategy::ProviderChoice] {
            assert_eq!(RoutingStrategy::parse(s.as_str()), Some(s));
        }
        assert_eq!(RoutingStrategy::parse("license_match"), None);
    }

    #[test]
    fn test_licensed_in() {
        let provider = Provider {
            id: 9,
            clinic_id: 1,
            display_name: "Dr. Example".to_string(),
            licensed_states: vec!["TX".to_string(), "CA".to_string()],
        };
        assert!(provider.licensed_in("TX"));
        assert!(!provider.licensed_in("NY"));
    }
}
