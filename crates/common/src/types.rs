//! Core types for CyberLab

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Registry id of a lab. The only identity the controller addresses labs by.
pub type LabId = i64;

/// Registry id of a user.
pub type UserId = i64;

/// Registry id of a lab session.
pub type SessionId = i64;

/// Declared lab status as stored in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl Default for LabStatus {
    fn default() -> Self {
        Self::Stopped
    }
}

impl LabStatus {
    /// Whether the registry claims containers are (or are about to be) up.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    /// Allowed edges: stopped -> starting -> running -> stopping -> stopped,
    /// any -> error, error -> stopping|stopped. Re-asserting the current
    /// status is always allowed.
    pub fn can_transition_to(&self, next: LabStatus) -> bool {
        use LabStatus::*;
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (_, Error)
                | (Error, Stopping)
                | (Error, Stopped)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LabStatus::Stopped => "stopped",
            LabStatus::Starting => "starting",
            LabStatus::Running => "running",
            LabStatus::Stopping => "stopping",
            LabStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for LabStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LabStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "stopped" => Ok(LabStatus::Stopped),
            "starting" => Ok(LabStatus::Starting),
            "running" => Ok(LabStatus::Running),
            "stopping" => Ok(LabStatus::Stopping),
            "error" => Ok(LabStatus::Error),
            other => Err(crate::Error::Internal(format!("unknown lab status: {}", other))),
        }
    }
}

/// A service a lab exposes once running
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Lab definition as stored in the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabDefinition {
    pub id: LabId,
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub difficulty: Option<String>,
    /// Compose file location; relative paths resolve against the labs root.
    pub compose_path: PathBuf,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub services: Vec<ServiceEndpoint>,
    pub estimated_minutes: u32,
    pub status: LabStatus,
}

/// Fields needed to register a new lab
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLab {
    pub name: String,
    pub slug: String,
    pub category: Option<String>,
    pub description: Option<String>,
    pub difficulty: Option<String>,
    pub compose_path: PathBuf,
    pub ports: Vec<u16>,
    pub services: Vec<ServiceEndpoint>,
    pub estimated_minutes: u32,
}

impl NewLab {
    pub fn new(name: impl Into<String>, slug: impl Into<String>, compose_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            slug: slug.into(),
            category: None,
            description: None,
            difficulty: None,
            compose_path: compose_path.into(),
            ports: Vec::new(),
            services: Vec::new(),
            estimated_minutes: 60,
        }
    }
}

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Stopped,
}

/// One start-to-stop lifecycle of a lab for a user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub user_id: UserId,
    pub lab_id: LabId,
    pub started_at: i64,
    pub stopped_at: Option<i64>,
    pub status: SessionStatus,
}

/// Activity record kinds written by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    LabStarted,
    LabStopped,
    LabRecovered,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::LabStarted => "lab_started",
            ActivityKind::LabStopped => "lab_stopped",
            ActivityKind::LabRecovered => "lab_recovered",
        }
    }
}

/// Persisted activity log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id: i64,
    pub user_id: UserId,
    pub lab_id: Option<LabId>,
    pub activity_type: String,
    pub title: String,
    pub timestamp: i64,
}
