//! Device and network condition samples fed to the adaptive controller.
//!
//! Signals arrive from the embedding application (browser connection API,
//! battery API, page visibility) or from the controller's own connectivity
//! probes. The controller only stores the latest sample of each kind.

use serde::{Deserialize, Serialize};

/// Observed network quality bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkQuality {
    /// Wired or strong broadband.
    Excellent,
    /// Ordinary broadband.
    Good,
    /// Constrained cellular.
    Fair,
    /// Weak or congested link.
    Poor,
    /// No connectivity.
    Offline,
    /// No sample yet.
    Unknown,
}

impl NetworkQuality {
    /// Whether this quality bucket permits active stream attempts.
    pub fn is_usable(&self) -> bool {
        !matches!(self, NetworkQuality::Offline)
    }
}

impl std::fmt::Display for NetworkQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NetworkQuality::Excellent => "excellent",
            NetworkQuality::Good => "good",
            NetworkQuality::Fair => "fair",
            NetworkQuality::Poor => "poor",
            NetworkQuality::Offline => "offline",
            NetworkQuality::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Battery / power sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    /// Percentage of battery remaining, 0-100.
    Battery(u8),
    /// Mains power or battery level unavailable.
    Unknown,
}

impl PowerState {
    /// True when the sampled level is below the given threshold.
    ///
    /// An unknown level is never treated as low power.
    pub fn is_low(&self, threshold: u8) -> bool {
        match self {
            PowerState::Battery(level) => *level < threshold,
            PowerState::Unknown => false,
        }
    }
}

/// Page / subtree visibility sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisibilityState {
    Foreground,
    Background,
}

impl VisibilityState {
    pub fn is_backgrounded(&self) -> bool {
        matches!(self, VisibilityState::Background)
    }
}

/// The latest sample of every signal kind.
#[derive(Debug, Clone, Copy)]
pub struct ConditionSnapshot {
    pub network: NetworkQuality,
    pub power: PowerState,
    pub visibility: VisibilityState,
}

impl Default for ConditionSnapshot {
    fn default() -> Self {
        Self {
            network: NetworkQuality::Unknown,
            power: PowerState::Unknown,
            visibility: VisibilityState::Foreground,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_low_power_threshold() {
        assert!(PowerState::Battery(19).is_low(20));
        assert!(!PowerState::Battery(20).is_low(20));
        assert!(!PowerState::Unknown.is_low(20));
    }

    #[test]
    fn test_offline_not_usable() {
        assert!(!NetworkQuality::Offline.is_usable());
        assert!(NetworkQuality::Unknown.is_usable());
        assert!(NetworkQuality::Poor.is_usable());
    }

    #[test]
    fn test_quality_serde_tags() {
        let json = serde_json::to_string(&NetworkQuality::Fair).unwrap();
        assert_eq!(json, "\"fair\"");
    }
}
