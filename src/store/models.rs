// src/store/models.rs

//! Records held by the state store and their row mappings

use crate::error::Result;
use rusqlite::{Connection, Row, params};

/// Kind of work a transaction performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionType {
    Build,
    Install,
    Uninstall,
    Update,
}

impl TransactionType {
    pub fn as_i32(&self) -> i32 {
        match self {
            TransactionType::Build => 0,
            TransactionType::Install => 1,
            TransactionType::Uninstall => 2,
            TransactionType::Update => 3,
        }
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(TransactionType::Build),
            1 => Some(TransactionType::Install),
            2 => Some(TransactionType::Uninstall),
            3 => Some(TransactionType::Update),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Build => "build",
            TransactionType::Install => "install",
            TransactionType::Uninstall => "uninstall",
            TransactionType::Update => "update",
        }
    }
}

/// Transaction state machine value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionStatus {
    Queued,
    Running,
    WaitingForInput,
    Completed,
    Failed,
    Cancelled,
}

impl TransactionStatus {
    pub fn as_i32(&self) -> i32 {
        match self {
            TransactionStatus::Queued => 0,
            TransactionStatus::Running => 1,
            TransactionStatus::WaitingForInput => 2,
            TransactionStatus::Completed => 3,
            TransactionStatus::Failed => 4,
            TransactionStatus::Cancelled => 5,
        }
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(TransactionStatus::Queued),
            1 => Some(TransactionStatus::Running),
            2 => Some(TransactionStatus::WaitingForInput),
            3 => Some(TransactionStatus::Completed),
            4 => Some(TransactionStatus::Failed),
            5 => Some(TransactionStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states set `completed_at`
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Completed | TransactionStatus::Failed | TransactionStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Queued => "queued",
            TransactionStatus::Running => "running",
            TransactionStatus::WaitingForInput => "waiting",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Cancelled => "cancelled",
        }
    }
}

/// What a transaction is blocked on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum WaitType {
    #[default]
    None,
    Transaction,
    Input,
    Reboot,
}

impl WaitType {
    pub fn as_i32(&self) -> i32 {
        match self {
            WaitType::None => 0,
            WaitType::Transaction => 1,
            WaitType::Input => 2,
            WaitType::Reboot => 3,
        }
    }

    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => WaitType::Transaction,
            2 => WaitType::Input,
            3 => WaitType::Reboot,
            _ => WaitType::None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Wait {
    pub wait_type: WaitType,
    pub data: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_i32(&self) -> i32 {
        match self {
            LogLevel::Info => 0,
            LogLevel::Warning => 1,
            LogLevel::Error => 2,
        }
    }

    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => LogLevel::Warning,
            2 => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

/// A command exported by an installed application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppCommand {
    pub name: String,
    pub path: String,
    pub arguments: Option<String>,
    pub command_type: String,
}

impl AppCommand {
    fn from_row(row: &Row) -> rusqlite::Result<(i64, Self)> {
        Ok((
            row.get(0)?,
            Self {
                name: row.get(1)?,
                path: row.get(2)?,
                arguments: row.get(3)?,
                command_type: row.get(4)?,
            },
        ))
    }
}

/// One installed revision of an application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    pub channel: String,
    pub major: i64,
    pub minor: i64,
    pub patch: i64,
    pub revision: i64,
    pub tag: Option<String>,
    pub size: i64,
    /// Unix seconds
    pub created: i64,
}

impl Revision {
    pub fn insert(&self, conn: &Connection, application_id: i64) -> Result<()> {
        conn.execute(
            "INSERT INTO revisions (application_id, channel, major, minor, patch, revision, tag, size, created)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                application_id,
                &self.channel,
                self.major,
                self.minor,
                self.patch,
                self.revision,
                &self.tag,
                self.size,
                self.created
            ],
        )?;
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<(i64, Self)> {
        Ok((
            row.get(0)?,
            Self {
                channel: row.get(1)?,
                major: row.get(2)?,
                minor: row.get(3)?,
                patch: row.get(4)?,
                revision: row.get(5)?,
                tag: row.get(6)?,
                size: row.get(7)?,
                created: row.get(8)?,
            },
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Application {
    pub id: i64,
    pub name: String,
    pub commands: Vec<AppCommand>,
    /// Append-only
    pub revisions: Vec<Revision>,
}

impl Application {
    pub fn insert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO applications (id, name) VALUES (?1, ?2)",
            params![self.id, &self.name],
        )?;
        for command in &self.commands {
            conn.execute(
                "INSERT INTO commands (application_id, name, path, arguments, type)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    self.id,
                    &command.name,
                    &command.path,
                    &command.arguments,
                    &command.command_type
                ],
            )?;
        }
        for rev in &self.revisions {
            rev.insert(conn, self.id)?;
        }
        Ok(())
    }

    pub fn delete(conn: &Connection, id: i64) -> Result<()> {
        conn.execute("DELETE FROM applications WHERE id = ?1", [id])?;
        Ok(())
    }

    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare("SELECT id, name FROM applications ORDER BY id")?;
        let mut apps = stmt
            .query_map([], |row| {
                Ok(Self {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    commands: Vec::new(),
                    revisions: Vec::new(),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT application_id, name, path, arguments, type FROM commands ORDER BY id",
        )?;
        let commands = stmt
            .query_map([], AppCommand::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT application_id, channel, major, minor, patch, revision, tag, size, created
             FROM revisions ORDER BY id",
        )?;
        let revisions = stmt
            .query_map([], Revision::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for app in &mut apps {
            app.commands = commands
                .iter()
                .filter(|(id, _)| *id == app.id)
                .map(|(_, c)| c.clone())
                .collect();
            app.revisions = revisions
                .iter()
                .filter(|(id, _)| *id == app.id)
                .map(|(_, r)| r.clone())
                .collect();
        }
        Ok(apps)
    }

    pub fn latest_revision(&self) -> Option<&Revision> {
        self.revisions.last()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub id: u32,
    pub transaction_type: TransactionType,
    pub flags: u32,
    pub state: TransactionStatus,
    pub name: String,
    pub description: Option<String>,
    pub wait: Wait,
    /// Unix seconds
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

impl Transaction {
    pub fn insert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO transactions (id, type, flags, state, name, description, wait_type, wait_data, created_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                self.id,
                self.transaction_type.as_i32(),
                self.flags,
                self.state.as_i32(),
                &self.name,
                &self.description,
                self.wait.wait_type.as_i32(),
                &self.wait.data,
                self.created_at,
                self.completed_at
            ],
        )?;
        Ok(())
    }

    pub fn update(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "UPDATE transactions SET flags = ?2, state = ?3, name = ?4, description = ?5,
             wait_type = ?6, wait_data = ?7 WHERE id = ?1",
            params![
                self.id,
                self.flags,
                self.state.as_i32(),
                &self.name,
                &self.description,
                self.wait.wait_type.as_i32(),
                &self.wait.data
            ],
        )?;
        Ok(())
    }

    pub fn complete(
        conn: &Connection,
        id: u32,
        state: TransactionStatus,
        completed_at: i64,
    ) -> Result<()> {
        conn.execute(
            "UPDATE transactions SET state = ?2, completed_at = ?3 WHERE id = ?1",
            params![id, state.as_i32(), completed_at],
        )?;
        Ok(())
    }

    pub fn delete(conn: &Connection, id: u32) -> Result<()> {
        conn.execute("DELETE FROM transactions WHERE id = ?1", [id])?;
        Ok(())
    }

    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, type, flags, state, name, description, wait_type, wait_data, created_at, completed_at
             FROM transactions ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Next free transaction id
    pub fn next_id(conn: &Connection) -> Result<u32> {
        let max: Option<u32> =
            conn.query_row("SELECT MAX(id) FROM transactions", [], |row| row.get(0))?;
        Ok(max.map_or(1, |m| m + 1))
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let type_value: i32 = row.get(1)?;
        let state_value: i32 = row.get(3)?;
        Ok(Self {
            id: row.get(0)?,
            transaction_type: TransactionType::from_i32(type_value).ok_or_else(|| {
                rusqlite::Error::IntegralValueOutOfRange(1, i64::from(type_value))
            })?,
            flags: row.get(2)?,
            state: TransactionStatus::from_i32(state_value).ok_or_else(|| {
                rusqlite::Error::IntegralValueOutOfRange(3, i64::from(state_value))
            })?,
            name: row.get(4)?,
            description: row.get(5)?,
            wait: Wait {
                wait_type: WaitType::from_i32(row.get(6)?),
                data: row.get(7)?,
            },
            created_at: row.get(8)?,
            completed_at: row.get(9)?,
        })
    }
}

/// Per-application state recorded inside a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionAppState {
    pub id: i64,
    pub transaction_id: u32,
    pub name: String,
    pub channel: Option<String>,
    pub revision: i64,
}

impl TransactionAppState {
    pub fn insert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO transactions_state (id, transaction_id, name, channel, revision)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                self.id,
                self.transaction_id,
                &self.name,
                &self.channel,
                self.revision
            ],
        )?;
        Ok(())
    }

    pub fn update(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "UPDATE transactions_state SET name = ?2, channel = ?3, revision = ?4 WHERE id = ?1",
            params![self.id, &self.name, &self.channel, self.revision],
        )?;
        Ok(())
    }

    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, transaction_id, name, channel, revision FROM transactions_state ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Self {
                    id: row.get(0)?,
                    transaction_id: row.get(1)?,
                    name: row.get(2)?,
                    channel: row.get(3)?,
                    revision: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionLog {
    pub id: i64,
    pub transaction_id: u32,
    pub level: LogLevel,
    /// Unix seconds
    pub timestamp: i64,
    /// Transaction state when the entry was written
    pub state: TransactionStatus,
    pub message: String,
}

impl TransactionLog {
    pub fn insert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO transaction_logs (id, transaction_id, level, timestamp, state, message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                self.id,
                self.transaction_id,
                self.level.as_i32(),
                self.timestamp,
                self.state.as_i32(),
                &self.message
            ],
        )?;
        Ok(())
    }

    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, transaction_id, level, timestamp, state, message
             FROM transaction_logs ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let state_value: i32 = row.get(4)?;
                Ok(Self {
                    id: row.get(0)?,
                    transaction_id: row.get(1)?,
                    level: LogLevel::from_i32(row.get(2)?),
                    timestamp: row.get(3)?,
                    state: TransactionStatus::from_i32(state_value).ok_or_else(|| {
                        rusqlite::Error::IntegralValueOutOfRange(4, i64::from(state_value))
                    })?,
                    message: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

/// Largest id in a table, or 0 when empty
pub(crate) fn max_id(conn: &Connection, table: &str) -> Result<i64> {
    let max: Option<i64> =
        conn.query_row(&format!("SELECT MAX(id) FROM {table}"), [], |row| row.get(0))?;
    Ok(max.unwrap_or(0))
}
