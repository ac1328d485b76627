//! Session tokens proving that a connecting peer was invited.

use std::fmt;
use std::str::FromStr;

use rand::Rng;

use crate::error::DataChannelError;

/// Token length in bytes (produces 32 hex characters).
const TOKEN_BYTES: usize = 16;

/// Length of the token on the wire.
pub const TOKEN_LEN: usize = TOKEN_BYTES * 2;

/// A 32-character lowercase hex secret shared out of band.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(String);

impl SessionToken {
    /// Generates a fresh token from the thread-local CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, received: &str) -> bool {
        self.matches_bytes(received.as_bytes())
    }

    /// Compares against a raw token field in constant time.
    pub fn matches_bytes(&self, received: &[u8]) -> bool {
        if received.len() != self.0.len() {
            return false;
        }
        let diff = received
            .iter()
            .zip(self.0.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        diff == 0
    }
}

impl FromStr for SessionToken {
    type Err = DataChannelError;

    /// Accepts exactly 32 hex digits, normalized to lowercase.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != TOKEN_LEN {
            return Err(DataChannelError::InvalidToken(format!(
                "expected {TOKEN_LEN} hex characters, got {}",
                s.len()
            )));
        }
        hex::decode(s).map_err(|e| DataChannelError::InvalidToken(e.to_string()))?;
        Ok(Self(s.to_ascii_lowercase()))
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Keeps the secret out of logs.
impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken({}…)", &self.0[..4])
    }
}
