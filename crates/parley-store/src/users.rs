//! CRUD operations for [`User`] records and the presence columns.

use chrono::{DateTime, Utc};
use rusqlite::params;

use parley_shared::UserId;

use crate::database::{parse_opt_ts, parse_ts, parse_uuid, Database};
use crate::error::{Result, StoreError};
use crate::models::User;

const USER_COLUMNS: &str =
    "id, username, full_name, bio, avatar_url, is_online, last_seen, created_at";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a new user record.
    pub fn create_user(&self, user: &User) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (id, username, full_name, bio, avatar_url, is_online, last_seen, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                user.id.to_string(),
                user.username,
                user.full_name,
                user.bio,
                user.avatar_url,
                user.is_online,
                user.last_seen.map(|t| t.to_rfc3339()),
                user.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single user by id.
    pub fn get_user(&self, id: UserId) -> Result<User> {
        self.conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id.to_string()],
                row_to_user,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// The user's display name, for payload hydration.
    pub fn display_name(&self, id: UserId) -> Result<String> {
        self.conn()
            .query_row(
                "SELECT username FROM users WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Every user except `caller`, ordered by username.
    pub fn list_users_except(&self, caller: UserId) -> Result<Vec<User>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id != ?1 ORDER BY username ASC"
        ))?;

        let rows = stmt.query_map(params![caller.to_string()], row_to_user)?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    /// Substring search on username or full name, excluding the caller.
    pub fn search_users(&self, caller: UserId, query: &str, limit: u32) -> Result<Vec<User>> {
        let pattern = format!("%{}%", escape_like(query));
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {USER_COLUMNS} FROM users
             WHERE id != ?1
               AND (username LIKE ?2 ESCAPE '\\' OR full_name LIKE ?2 ESCAPE '\\')
             ORDER BY username ASC
             LIMIT ?3"
        ))?;

        let rows = stmt.query_map(params![caller.to_string(), pattern, limit], row_to_user)?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    // ------------------------------------------------------------------
    // Presence
    // ------------------------------------------------------------------

    /// Flip the online flag and stamp last-seen. Called only on presence
    /// transitions.
    pub fn set_presence(&self, id: UserId, online: bool, at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE users SET is_online = ?2, last_seen = ?3 WHERE id = ?1",
            params![id.to_string(), online, at.to_rfc3339()],
        )?;
        Ok(())
    }
}

/// Escape `%`, `_` and `\` so user input cannot act as LIKE wildcards.
pub(crate) fn escape_like(query: &str) -> String {
    query
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Map a `rusqlite::Row` to a [`User`].
fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let id_str: String = row.get(0)?;
    let last_seen_str: Option<String> = row.get(6)?;
    let created_str: String = row.get(7)?;

    Ok(User {
        id: UserId(parse_uuid(0, &id_str)?),
        username: row.get(1)?,
        full_name: row.get(2)?,
        bio: row.get(3)?,
        avatar_url: row.get(4)?,
        is_online: row.get(5)?,
        last_seen: parse_opt_ts(6, last_seen_str)?,
        created_at: parse_ts(7, &created_str)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn open_test_db() -> (Database, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        (db, dir)
    }

    pub(crate) fn sample_user(username: &str) -> User {
        User {
            id: UserId::new(),
            username: username.to_string(),
            full_name: None,
            bio: None,
            avatar_url: None,
            is_online: false,
            last_seen: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_create_and_get() {
        let (db, _dir) = open_test_db();
        let user = sample_user("alice");
        db.create_user(&user).unwrap();

        let fetched = db.get_user(user.id).unwrap();
        assert_eq!(fetched.username, "alice");
        assert!(!fetched.is_online);
    }

    #[test]
    fn test_duplicate_username_rejected() {
        let (db, _dir) = open_test_db();
        db.create_user(&sample_user("alice")).unwrap();
        assert!(db.create_user(&sample_user("alice")).is_err());
    }

    #[test]
    fn test_search_excludes_caller_and_matches_substring() {
        let (db, _dir) = open_test_db();
        let alice = sample_user("alice");
        let mut bob = sample_user("bob");
        bob.full_name = Some("Alistair Bob".to_string());
        let carol = sample_user("carol");
        for u in [&alice, &bob, &carol] {
            db.create_user(u).unwrap();
        }

        let hits = db.search_users(alice.id, "ali", 20).unwrap();
        let names: Vec<_> = hits.iter().map(|u| u.username.as_str()).collect();
        assert_eq!(names, vec!["bob"]);
    }

    #[test]
    fn test_search_escapes_wildcards() {
        let (db, _dir) = open_test_db();
        let caller = sample_user("caller");
        db.create_user(&caller).unwrap();
        db.create_user(&sample_user("percent")).unwrap();

        // a bare "%" would match everything if not escaped
        assert!(db.search_users(caller.id, "%", 20).unwrap().is_empty());
    }

    #[test]
    fn test_set_presence() {
        let (db, _dir) = open_test_db();
        let user = sample_user("dora");
        db.create_user(&user).unwrap();

        let at = Utc::now();
        db.set_presence(user.id, true, at).unwrap();
        let fetched = db.get_user(user.id).unwrap();
        assert!(fetched.is_online);
        assert!(fetched.last_seen.is_some());
    }
}
