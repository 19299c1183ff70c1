//! Parameters of a multi-quorum evaluation.

use serde::{Deserialize, Serialize};

/// Invalid evaluation parameters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// At least one quorum is required.
    #[error("the quorum count must be at least 1")]
    NoQuorums,
    /// Quorums need at least one member.
    #[error("the quorum size must be at least 1")]
    EmptyQuorums,
    /// A quorum would be larger than the set of parties.
    #[error("quorums of {quorum_size} parties cannot be formed from {parties} parties")]
    QuorumTooLarge {
        /// Configured quorum size.
        quorum_size: usize,
        /// Number of parties.
        parties: usize,
    },
    /// The quorums cannot contain every party.
    #[error("{quorum_count} quorums of {quorum_size} parties cannot cover {parties} parties")]
    Uncoverable {
        /// Configured number of quorums.
        quorum_count: usize,
        /// Configured quorum size.
        quorum_size: usize,
        /// Number of parties.
        parties: usize,
    },
}

/// How quorums are formed for an evaluation.
///
/// Missing fields fall back to the defaults, so `{"seed": 7}` is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// The number of quorums the gates are spread over.
    pub quorum_count: usize,
    /// The number of parties per quorum.
    pub quorum_size: usize,
    /// The seed all parties use to draw the same quorums.
    pub seed: u64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            quorum_count: 2,
            quorum_size: 6,
            seed: 0,
        }
    }
}

impl EvaluationConfig {
    /// Checks that quorums can be drawn from `parties` parties.
    pub fn validate(&self, parties: usize) -> Result<(), ConfigError> {
        if self.quorum_count == 0 {
            return Err(ConfigError::NoQuorums);
        }
        if self.quorum_size == 0 {
            return Err(ConfigError::EmptyQuorums);
        }
        if self.quorum_size > parties {
            return Err(ConfigError::QuorumTooLarge {
                quorum_size: self.quorum_size,
                parties,
            });
        }
        if self.quorum_count.saturating_mul(self.quorum_size) < parties {
            return Err(ConfigError::Uncoverable {
                quorum_count: self.quorum_count,
                quorum_size: self.quorum_size,
                parties,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_uses_defaults() {
        let config: EvaluationConfig = serde_json::from_str(r#"{"seed": 7}"#).unwrap();
        assert_eq!(
            config,
            EvaluationConfig {
                seed: 7,
                ..Default::default()
            }
        );
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(
            json,
            r#"{"quorum_count":2,"quorum_size":6,"seed":7}"#
        );
    }

    #[test]
    fn validation() {
        let config = EvaluationConfig::default();
        assert_eq!(config.validate(12), Ok(()));
        assert_eq!(config.validate(6), Ok(()));
        assert_eq!(
            config.validate(5),
            Err(ConfigError::QuorumTooLarge {
                quorum_size: 6,
                parties: 5
            })
        );
        assert_eq!(
            config.validate(13),
            Err(ConfigError::Uncoverable {
                quorum_count: 2,
                quorum_size: 6,
                parties: 13
            })
        );
        let none = EvaluationConfig {
            quorum_count: 0,
            ..config
        };
        assert_eq!(none.validate(3), Err(ConfigError::NoQuorums));
    }
}
