//! Lifecycle message vocabulary

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A plaintext control message
///
/// The vocabulary is closed and matched case-sensitively. Anything else arriving on the
/// wire is a protocol violation that receivers log and ignore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlMessage {
    /// Proxy → agent: shut the managed server down
    Stop,
    /// Agent → proxy: the managed server is running (unsolicited, or a status answer)
    Started,
    /// Agent → proxy: the managed server has stopped
    Stopped,
}

/// A decoded payload outside the known vocabulary
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown control message: {0:?}")]
pub struct UnknownMessage(pub String);

impl ControlMessage {
    pub const ALL: [ControlMessage; 3] = [Self::Stop, Self::Started, Self::Stopped];

    /// Wire token for this message
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Started => "started",
            Self::Stopped => "stopped",
        }
    }

    pub fn as_bytes(&self) -> &'static [u8] {
        self.as_str().as_bytes()
    }

    /// Match a decrypted payload against the vocabulary
    ///
    /// Returns `None` for anything that is not exactly one of the tokens, including
    /// garbage produced by decrypting with the wrong key.
    pub fn from_wire(payload: &[u8]) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|message| message.as_bytes() == payload)
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlMessage {
    type Err = UnknownMessage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_wire(s.as_bytes()).ok_or_else(|| UnknownMessage(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens() {
        assert_eq!(ControlMessage::Stop.as_str(), "stop");
        assert_eq!(ControlMessage::Started.as_str(), "started");
        assert_eq!(ControlMessage::Stopped.as_str(), "stopped");
    }

    #[test]
    fn test_from_wire_exact_match() {
        assert_eq!(
            ControlMessage::from_wire(b"started"),
            Some(ControlMessage::Started)
        );
        assert_eq!(
            ControlMessage::from_wire(b"stopped"),
            Some(ControlMessage::Stopped)
        );
        assert_eq!(ControlMessage::from_wire(b"stop"), Some(ControlMessage::Stop));
    }

    #[test]
    fn test_from_wire_rejects_near_misses() {
        assert_eq!(ControlMessage::from_wire(b"Started"), None);
        assert_eq!(ControlMessage::from_wire(b"started\n"), None);
        assert_eq!(ControlMessage::from_wire(b" stop"), None);
        assert_eq!(ControlMessage::from_wire(b""), None);
        assert_eq!(ControlMessage::from_wire(&[0xff, 0x00, 0x13]), None);
    }

    #[test]
    fn test_from_str() {
        assert_eq!("stop".parse::<ControlMessage>(), Ok(ControlMessage::Stop));

        let err = "restart".parse::<ControlMessage>().unwrap_err();
        assert_eq!(err, UnknownMessage("restart".to_string()));
        assert!(err.to_string().contains("restart"));
    }

    #[test]
    fn test_display_matches_wire_token() {
        for message in ControlMessage::ALL {
            assert_eq!(message.to_string(), message.as_str());
        }
    }
}
