//! Fault scenarios exercised by the simulator.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioId {
    /// Peers in one leaf discover each other and track positions
    Convergence,

    /// One avatar leaves for another leaf and is evicted by the rest
    Crossing,

    /// One peer goes silent and is dropped after the timeout threshold
    Dropout,

    /// Two halves are partitioned, then healed and resynchronized
    SplitBrain,

    /// Every link loses a share of messages
    LossyLink,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Convergence,
            ScenarioId::Crossing,
            ScenarioId::Dropout,
            ScenarioId::SplitBrain,
            ScenarioId::LossyLink,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Convergence => "convergence",
            ScenarioId::Crossing => "crossing",
            ScenarioId::Dropout => "dropout",
            ScenarioId::SplitBrain => "split_brain",
            ScenarioId::LossyLink => "lossy_link",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Convergence => "all peers in one leaf, every peer ends with every other's position",
            ScenarioId::Crossing => "one avatar jumps to an untracked leaf, observers evict it, a follower rediscovers it",
            ScenarioId::Dropout => "one peer shuts down, the rest drop it after the timeout threshold",
            ScenarioId::SplitBrain => "partition two halves for 8s, heal, verify full visibility returns",
            ScenarioId::LossyLink => "20% loss on every link, verify positions still converge without drops",
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
        match s.to_lowercase().replace('-', "_").as_str() {
            "convergence" => Ok(ScenarioId::Convergence),
            "crossing" => Ok(ScenarioId::Crossing),
            "dropout" => Ok(ScenarioId::Dropout),
            "split_brain" | "splitbrain" => Ok(ScenarioId::SplitBrain),
            "lossy_link" | "lossylink" => Ok(ScenarioId::LossyLink),
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
            assert_eq!(scenario.to_string(), scenario.name());
        }
        assert_eq!("Split-Brain".parse::<ScenarioId>(), Ok(ScenarioId::SplitBrain));
        assert!("time_warp".parse::<ScenarioId>().is_err());
    }
}
