//! Simulation scenarios.

use serde::Serialize;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// LT-001: Baseline outbreak over a fault-free ledger
    Outbreak,

    /// LT-002: Dropped publishes, lost acknowledgements and failed fetches
    FlakyLedger,

    /// LT-003: Impostor, corrupted and garbage notification records plus
    /// agent records rewritten in storage
    Forgery,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![ScenarioId::Outbreak, ScenarioId::FlakyLedger, ScenarioId::Forgery]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Outbreak => "outbreak",
            ScenarioId::FlakyLedger => "flaky_ledger",
            ScenarioId::Forgery => "forgery",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Outbreak => "Agents wander, infected agents check in, contacts get notified",
            ScenarioId::FlakyLedger => "20% dropped publishes + 10% lost acks, verify retries never fork a chain",
            ScenarioId::Forgery => "Forged notifications and rewritten agent records, verify each one is rejected",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "outbreak" | "lt-001" => Ok(ScenarioId::Outbreak),
            "flaky_ledger" | "flakyledger" | "flaky" | "lt-002" => Ok(ScenarioId::FlakyLedger),
            "forgery" | "lt-003" => Ok(ScenarioId::Forgery),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>(), Ok(scenario));
        }
        assert_eq!("LT-002".parse::<ScenarioId>(), Ok(ScenarioId::FlakyLedger));
        assert!("split_brain".parse::<ScenarioId>().is_err());
    }
}
