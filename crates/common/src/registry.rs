//! Lab registry interface
//!
//! Persistent store of lab definitions, sessions and activity. The lifecycle
//! controller reads definitions and writes status, session and activity
//! records only through this trait.

use crate::types::*;
use crate::Result;

pub trait LabRegistry: Send + Sync {
    /// Get a lab definition by id
    fn get_lab_by_id(&self, id: LabId) -> Result<Option<LabDefinition>>;

    /// List all lab definitions
    fn list_labs(&self) -> Result<Vec<LabDefinition>>;

    /// Set the declared status of a lab
    fn update_lab_status(&self, id: LabId, status: LabStatus) -> Result<()>;

    /// Open a session, returning its id
    fn create_session(&self, user_id: UserId, lab_id: LabId) -> Result<SessionId>;

    /// Close a session, stamping its stop time
    fn end_session(&self, session_id: SessionId) -> Result<()>;

    /// Get a session by id
    fn get_session(&self, session_id: SessionId) -> Result<Option<Session>>;

    /// Sessions for a lab that have not been closed
    fn open_sessions_for_lab(&self, lab_id: LabId) -> Result<Vec<Session>>;

    /// Append an activity record
    fn log_activity(&self, user_id: UserId, lab_id: LabId, kind: ActivityKind, title: &str) -> Result<()>;
}
