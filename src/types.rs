// =============================================================================
// Shared types used across the Helios experiment control plane
// =============================================================================

use serde::{Deserialize, Serialize};

/// What kind of worker a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    Train,
    Backtest,
}

impl std::fmt::Display for RunType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Train => write!(f, "train"),
            Self::Backtest => write!(f, "backtest"),
        }
    }
}

impl std::str::FromStr for RunType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" => Ok(Self::Train),
            "backtest" => Ok(Self::Backtest),
            other => Err(format!("unknown run type: {other}")),
        }
    }
}

/// Lifecycle status of a run.
///
/// Transitions form a DAG: QUEUED -> RUNNING -> {SUCCEEDED | FAILED |
/// CANCELLED}. Terminal states never regress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Whether the status is final for the run.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "QUEUED"),
            Self::Running => write!(f, "RUNNING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "RUNNING" => Ok(Self::Running),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_wire_format_is_uppercase() {
        let s = serde_json::to_string(&RunStatus::Queued).unwrap();
        assert_eq!(s, "\"QUEUED\"");
        let back: RunStatus = serde_json::from_str("\"CANCELLED\"").unwrap();
        assert_eq!(back, RunStatus::Cancelled);
    }

    #[test]
    fn run_type_wire_format_is_lowercase() {
        let s = serde_json::to_string(&RunType::Backtest).unwrap();
        assert_eq!(s, "\"backtest\"");
    }

    #[test]
    fn terminal_states() {
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn display_and_parse_roundtrip() {
        for st in [
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Succeeded,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            let parsed: RunStatus = st.to_string().parse().unwrap();
            assert_eq!(parsed, st);
        }
        for ty in [RunType::Train, RunType::Backtest] {
            let parsed: RunType = ty.to_string().parse().unwrap();
            assert_eq!(parsed, ty);
        }
    }
}
