use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Where a checkout session is in the identification flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingPhase {
    #[default]
    Initial,
    Initializing,
    Collecting,
    Processing,
    Sending,
    Stored,
    Identifying,
    Complete,
    Error,
}

impl ProcessingPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingPhase::Initial => "initial",
            ProcessingPhase::Initializing => "initializing",
            ProcessingPhase::Collecting => "collecting",
            ProcessingPhase::Processing => "processing",
            ProcessingPhase::Sending => "sending",
            ProcessingPhase::Stored => "stored",
            ProcessingPhase::Identifying => "identifying",
            ProcessingPhase::Complete => "complete",
            ProcessingPhase::Error => "error",
        }
    }

    /// Forward transitions of the flow. `Error` is reachable from anywhere;
    /// `Initial` only through a reset, which bypasses this check.
    pub fn can_transition_to(self, next: ProcessingPhase) -> bool {
        use ProcessingPhase::*;

        matches!(
            (self, next),
            (_, Error)
                | (Initial, Initializing)
                | (Initial, Collecting)
                | (Initializing, Collecting)
                | (Collecting, Initializing)
                | (Collecting, Processing)
                | (Initializing, Processing)
                | (Processing, Sending)
                | (Sending, Stored)
                | (Stored, Identifying)
                | (Identifying, Complete)
        )
    }

    /// Phases that are never left behind in storage; a session restored in
    /// one of these would be waiting on a request that no longer exists.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            ProcessingPhase::Initializing
                | ProcessingPhase::Collecting
                | ProcessingPhase::Sending
                | ProcessingPhase::Identifying
        )
    }
}

impl fmt::Display for ProcessingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initial" => Ok(ProcessingPhase::Initial),
            "initializing" => Ok(ProcessingPhase::Initializing),
            "collecting" => Ok(ProcessingPhase::Collecting),
            "processing" => Ok(ProcessingPhase::Processing),
            "sending" => Ok(ProcessingPhase::Sending),
            "stored" => Ok(ProcessingPhase::Stored),
            "identifying" => Ok(ProcessingPhase::Identifying),
            "complete" => Ok(ProcessingPhase::Complete),
            "error" => Ok(ProcessingPhase::Error),
            other => Err(format!("unknown processing phase: {other}")),
        }
    }
}
