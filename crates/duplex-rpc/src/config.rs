//! Client configuration.
//!
//! The server has no configuration beyond its procedure table.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How the client generates call identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UidStrategy {
    /// Per-client `u64` counter rendered as lowercase hex. Never repeats
    /// within 2^64 calls on one client.
    #[default]
    Counter,
    /// UUID v4. 122 random bits, so the chance of any collision among `n`
    /// identifiers is about n² / 2^123.
    Random,
}

impl UidStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            UidStrategy::Counter => "counter",
            UidStrategy::Random => "random",
        }
    }
}

impl fmt::Display for UidStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UidStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "counter" => Ok(UidStrategy::Counter),
            "random" | "uuid" => Ok(UidStrategy::Random),
            other => Err(format!("unknown uid strategy: {}", other)),
        }
    }
}

/// Runtime options for [`crate::RpcClient`].
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub uid_strategy: UidStrategy,
    /// Give up on a call after this long. `None` waits forever, and a call
    /// whose reply never arrives stays pending for the channel's lifetime.
    pub call_timeout: Option<Duration>,
}

impl ClientConfig {
    pub fn with_uid_strategy(mut self, strategy: UidStrategy) -> Self {
        self.uid_strategy = strategy;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }
}
