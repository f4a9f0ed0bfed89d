//! Per-server lifecycle state

use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a managed server
///
/// `Destroying` and `Snapshotting` belong to the external orchestration layer; while a
/// server is in either, the control listener ignores everything it sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ServerState {
    #[default]
    Unavailable,
    Starting,
    Started,
    Destroying,
    Snapshotting,
}

impl ServerState {
    /// True for the teardown states owned by orchestration
    pub fn is_teardown(&self) -> bool {
        matches!(self, Self::Destroying | Self::Snapshotting)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unavailable => "unavailable",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Destroying => "destroying",
            Self::Snapshotting => "snapshotting",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unavailable" => Ok(Self::Unavailable),
            "starting" => Ok(Self::Starting),
            "started" => Ok(Self::Started),
            "destroying" => Ok(Self::Destroying),
            "snapshotting" => Ok(Self::Snapshotting),
            other => Err(format!("Invalid server state: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_teardown_states() {
        assert!(ServerState::Destroying.is_teardown());
        assert!(ServerState::Snapshotting.is_teardown());
        assert!(!ServerState::Unavailable.is_teardown());
        assert!(!ServerState::Starting.is_teardown());
        assert!(!ServerState::Started.is_teardown());
    }

    #[test]
    fn test_parse() {
        assert_eq!("Started".parse::<ServerState>(), Ok(ServerState::Started));
        assert_eq!(" snapshotting ".parse::<ServerState>(), Ok(ServerState::Snapshotting));
        assert!("running".parse::<ServerState>().is_err());
    }

    #[test]
    fn test_default_is_unavailable() {
        assert_eq!(ServerState::default(), ServerState::Unavailable);
    }
}
