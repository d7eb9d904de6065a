use crate::WorkforgeError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Role of a worker and of every subtask it processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Produces the implementation file.
    Executor,
    /// Produces tests for an accepted implementation.
    Tester,
    /// Produces documentation for an accepted implementation.
    Documenter,
}

impl Role {
    /// Every role, in dispatch order.
    pub const ALL: [Role; 3] = [Role::Executor, Role::Tester, Role::Documenter];

    /// Lowercase identifier used in config keys and wire messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Executor => "executor",
            Role::Tester => "tester",
            Role::Documenter => "documenter",
        }
    }

    /// Roles spawned for a file once its executor subtask is accepted.
    pub fn follow_ons(&self) -> &'static [Role] {
        match self {
            Role::Executor => &[Role::Tester, Role::Documenter],
            Role::Tester | Role::Documenter => &[],
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = WorkforgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "executor" => Ok(Role::Executor),
            "tester" => Ok(Role::Tester),
            "documenter" => Ok(Role::Documenter),
            other => Err(WorkforgeError::Config(format!("Unknown role '{other}'"))),
        }
    }
}
