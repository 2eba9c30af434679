//! Durable mirror of live connections.
//!
//! Advisory only: the in-memory registry is authoritative for routing, and
//! the server wipes this table at startup since no session survives a
//! process restart.

use rusqlite::params;

use parley_shared::{ConnectionId, UserId};

use crate::database::{parse_ts, parse_uuid, Database};
use crate::error::Result;
use crate::models::Session;

impl Database {
    /// Record a newly-admitted connection.
    pub fn insert_session(&self, session: &Session) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO sessions (connection_id, user_id, connected_at)
             VALUES (?1, ?2, ?3)",
            params![
                session.connection_id.to_string(),
                session.user_id.to_string(),
                session.connected_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Remove a dismissed connection. Idempotent.
    pub fn delete_session(&self, connection: ConnectionId) -> Result<()> {
        self.conn().execute(
            "DELETE FROM sessions WHERE connection_id = ?1",
            params![connection.to_string()],
        )?;
        Ok(())
    }

    /// Mirror rows for one user, for inspection.
    pub fn sessions_for_user(&self, user: UserId) -> Result<Vec<Session>> {
        let mut stmt = self.conn().prepare(
            "SELECT connection_id, user_id, connected_at
             FROM sessions WHERE user_id = ?1
             ORDER BY connected_at ASC",
        )?;

        let rows = stmt.query_map(params![user.to_string()], |row| {
            let connection_str: String = row.get(0)?;
            let user_str: String = row.get(1)?;
            let connected_str: String = row.get(2)?;
            Ok(Session {
                connection_id: ConnectionId(parse_uuid(0, &connection_str)?),
                user_id: UserId(parse_uuid(1, &user_str)?),
                connected_at: parse_ts(2, &connected_str)?,
            })
        })?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }

    /// Drop every mirror row. Called once at server startup.
    pub fn clear_sessions(&self) -> Result<usize> {
        let affected = self.conn().execute("DELETE FROM sessions", [])?;
        Ok(affected)
    }
}
