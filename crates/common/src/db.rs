//! SQLite database for CyberLab state persistence

use crate::registry::LabRegistry;
use crate::types::*;
use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const LAB_COLUMNS: &str = "id, name, slug, category, description, difficulty, compose_path, ports, services, estimated_minutes, status";
const SESSION_COLUMNS: &str = "id, user_id, lab_id, started_at, stopped_at, status";

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- Lab definitions
            CREATE TABLE IF NOT EXISTS labs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                slug TEXT NOT NULL UNIQUE,
                category TEXT,
                description TEXT,
                difficulty TEXT,
                compose_path TEXT NOT NULL,
                ports TEXT NOT NULL DEFAULT '[]',
                services TEXT NOT NULL DEFAULT '[]',
                estimated_minutes INTEGER NOT NULL DEFAULT 60,
                status TEXT NOT NULL DEFAULT 'stopped',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- Lab sessions
            CREATE TABLE IF NOT EXISTS lab_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                lab_id INTEGER NOT NULL,
                started_at INTEGER NOT NULL,
                stopped_at INTEGER,
                status TEXT NOT NULL DEFAULT 'running',
                FOREIGN KEY (lab_id) REFERENCES labs(id)
            );
            CREATE INDEX IF NOT EXISTS idx_lab_sessions_lab ON lab_sessions(lab_id, status);

            -- Activity log
            CREATE TABLE IF NOT EXISTS activity_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                lab_id INTEGER,
                activity_type TEXT NOT NULL,
                title TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                FOREIGN KEY (lab_id) REFERENCES labs(id)
            );
            CREATE INDEX IF NOT EXISTS idx_activity_log_lab ON activity_log(lab_id);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    // ========================================================================
    // Labs
    // ========================================================================

    /// Register a lab definition. Slugs are unique; an existing slug is left untouched.
    pub fn insert_lab(&self, lab: &NewLab) -> Result<LabId> {
        let conn = self.conn.lock();
        let now = chrono::Utc::now().timestamp();

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO labs
                (name, slug, category, description, difficulty, compose_path, ports, services, estimated_minutes, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                lab.name,
                lab.slug,
                lab.category,
                lab.description,
                lab.difficulty,
                lab.compose_path.to_string_lossy().into_owned(),
                serde_json::to_string(&lab.ports)?,
                serde_json::to_string(&lab.services)?,
                lab.estimated_minutes,
                now,
                now,
            ],
        )?;

        let id: LabId = conn.query_row(
            "SELECT id FROM labs WHERE slug = ?1",
            params![lab.slug],
            |row| row.get(0),
        )?;

        if inserted > 0 {
            debug!("Inserted lab {} with id {}", lab.slug, id);
        }
        Ok(id)
    }

    /// Seed the stock labs shipped with the portal
    pub fn seed_default_labs(&self) -> Result<Vec<LabId>> {
        let ids = default_labs()
            .iter()
            .map(|lab| self.insert_lab(lab))
            .collect::<Result<Vec<_>>>()?;
        info!("Seeded {} default labs", ids.len());
        Ok(ids)
    }

    // ========================================================================
    // Activity
    // ========================================================================

    /// Activity records for a lab, newest first
    pub fn list_activity(&self, lab_id: LabId) -> Result<Vec<ActivityRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, lab_id, activity_type, title, timestamp
             FROM activity_log WHERE lab_id = ?1 ORDER BY id DESC",
        )?;
        let rows = stmt.query_map(params![lab_id], |row| {
            Ok(ActivityRecord {
                id: row.get(0)?,
                user_id: row.get(1)?,
                lab_id: row.get(2)?,
                activity_type: row.get(3)?,
                title: row.get(4)?,
                timestamp: row.get(5)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}

impl LabRegistry for Database {
    fn get_lab_by_id(&self, id: LabId) -> Result<Option<LabDefinition>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM labs WHERE id = ?1", LAB_COLUMNS),
                params![id],
                RawLab::from_row,
            )
            .optional()?;

        raw.map(RawLab::parse).transpose()
    }

    fn list_labs(&self) -> Result<Vec<LabDefinition>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM labs ORDER BY difficulty, name",
            LAB_COLUMNS
        ))?;
        let rows = stmt.query_map([], RawLab::from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?.parse()?);
        }
        Ok(results)
    }

    fn update_lab_status(&self, id: LabId, status: LabStatus) -> Result<()> {
        let conn = self.conn.lock();
        let now = chrono::Utc::now().timestamp();
        let rows = conn.execute(
            "UPDATE labs SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now, id],
        )?;
        if rows == 0 {
            return Err(Error::lab_not_found(id));
        }
        debug!("Lab {} status -> {}", id, status);
        Ok(())
    }

    fn create_session(&self, user_id: UserId, lab_id: LabId) -> Result<SessionId> {
        let conn = self.conn.lock();
        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "INSERT INTO lab_sessions (user_id, lab_id, started_at, status) VALUES (?1, ?2, ?3, 'running')",
            params![user_id, lab_id, now],
        )?;
        let id = conn.last_insert_rowid();
        debug!("Opened session {} for lab {} (user {})", id, lab_id, user_id);
        Ok(id)
    }

    fn end_session(&self, session_id: SessionId) -> Result<()> {
        let conn = self.conn.lock();
        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "UPDATE lab_sessions SET stopped_at = ?1, status = 'stopped'
             WHERE id = ?2 AND stopped_at IS NULL",
            params![now, session_id],
        )?;
        Ok(())
    }

    fn get_session(&self, session_id: SessionId) -> Result<Option<Session>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM lab_sessions WHERE id = ?1", SESSION_COLUMNS),
                params![session_id],
                session_from_row,
            )
            .optional()?;
        Ok(raw)
    }

    fn open_sessions_for_lab(&self, lab_id: LabId) -> Result<Vec<Session>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM lab_sessions WHERE lab_id = ?1 AND stopped_at IS NULL ORDER BY id",
            SESSION_COLUMNS
        ))?;
        let rows = stmt.query_map(params![lab_id], session_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    fn log_activity(&self, user_id: UserId, lab_id: LabId, kind: ActivityKind, title: &str) -> Result<()> {
        let conn = self.conn.lock();
        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "INSERT INTO activity_log (user_id, lab_id, activity_type, title, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user_id, lab_id, kind.as_str(), title, now],
        )?;
        Ok(())
    }
}

/// Raw lab row before JSON columns are parsed
struct RawLab {
    id: LabId,
    name: String,
    slug: String,
    category: Option<String>,
    description: Option<String>,
    difficulty: Option<String>,
    compose_path: String,
    ports: String,
    services: String,
    estimated_minutes: u32,
    status: String,
}

impl RawLab {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            slug: row.get(2)?,
            category: row.get(3)?,
            description: row.get(4)?,
            difficulty: row.get(5)?,
            compose_path: row.get(6)?,
            ports: row.get(7)?,
            services: row.get(8)?,
            estimated_minutes: row.get(9)?,
            status: row.get(10)?,
        })
    }

    fn parse(self) -> Result<LabDefinition> {
        Ok(LabDefinition {
            id: self.id,
            name: self.name,
            slug: self.slug,
            category: self.category,
            description: self.description,
            difficulty: self.difficulty,
            compose_path: PathBuf::from(self.compose_path),
            ports: serde_json::from_str(&self.ports)?,
            services: serde_json::from_str(&self.services)?,
            estimated_minutes: self.estimated_minutes,
            status: self.status.parse()?,
        })
    }
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    let status: String = row.get(5)?;
    Ok(Session {
        id: row.get(0)?,
        user_id: row.get(1)?,
        lab_id: row.get(2)?,
        started_at: row.get(3)?,
        stopped_at: row.get(4)?,
        status: if status == "running" {
            SessionStatus::Running
        } else {
            SessionStatus::Stopped
        },
    })
}

fn service(name: &str, port: u16, url: &str, description: &str) -> ServiceEndpoint {
    ServiceEndpoint {
        name: name.to_string(),
        port,
        url: Some(url.to_string()),
        description: Some(description.to_string()),
    }
}

/// The stock lab catalog
pub fn default_labs() -> Vec<NewLab> {
    vec![
        NewLab {
            name: "OpenPLC Controller".to_string(),
            slug: "openplc".to_string(),
            category: Some("plc".to_string()),
            description: Some("Program PLCs with ladder logic over Modbus using OpenPLC".to_string()),
            difficulty: Some("beginner".to_string()),
            compose_path: PathBuf::from("openplc/docker-compose.yml"),
            ports: vec![8080],
            services: vec![service(
                "OpenPLC Web Interface",
                8080,
                "http://localhost:8080",
                "PLC Programming Environment",
            )],
            estimated_minutes: 60,
        },
        NewLab {
            name: "SCADA Dashboard".to_string(),
            slug: "scada-dashboard".to_string(),
            category: Some("scada".to_string()),
            description: Some("Build SCADA dashboards and data flows with Node-RED".to_string()),
            difficulty: Some("beginner".to_string()),
            compose_path: PathBuf::from("scada-dashboard/docker-compose.yml"),
            ports: vec![1880, 1881],
            services: vec![
                service("Flow Editor", 1880, "http://localhost:1880", "Node-RED Flow Editor"),
                service("Dashboard", 1881, "http://localhost:1881/ui", "SCADA Dashboard UI"),
            ],
            estimated_minutes: 60,
        },
        NewLab {
            name: "Network Security".to_string(),
            slug: "network-security".to_string(),
            category: Some("network".to_string()),
            description: Some("Capture packets, analyze protocols and detect anomalies".to_string()),
            difficulty: Some("intermediate".to_string()),
            compose_path: PathBuf::from("network-security/docker-compose.yml"),
            ports: vec![8082],
            services: vec![service(
                "Network Monitor",
                8082,
                "http://localhost:8082",
                "Packet Capture & Analysis",
            )],
            estimated_minutes: 50,
        },
        NewLab {
            name: "Penetration Testing".to_string(),
            slug: "pentest".to_string(),
            category: Some("pentest".to_string()),
            description: Some("Practice ethical hacking with Kali Linux tooling".to_string()),
            difficulty: Some("advanced".to_string()),
            compose_path: PathBuf::from("pentest/docker-compose.yml"),
            ports: vec![7681],
            services: vec![service("Web Terminal", 7681, "http://localhost:7681", "Kali Linux Terminal")],
            estimated_minutes: 90,
        },
    ]
}
