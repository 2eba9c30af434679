//! Notification records. Every query is owner-scoped so a user can never
//! read or mutate another user's notifications, and a miss looks the same
//! as a missing row.

use chrono::{DateTime, Utc};
use rusqlite::params;

use parley_shared::{NotificationId, NotificationKind, UserId};

use crate::database::{parse_kind, parse_opt_ts, parse_ts, parse_uuid, Database};
use crate::error::Result;
use crate::models::Notification;

const NOTIFICATION_COLUMNS: &str = "id, user_id, from_user_id, title, body, kind, \
                                    related_entity, is_read, read_at, created_at";

impl Database {
    /// Insert a notification record.
    pub fn insert_notification(&self, notification: &Notification) -> Result<()> {
        self.conn().execute(
            &format!(
                "INSERT INTO notifications ({NOTIFICATION_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                notification.id.to_string(),
                notification.user_id.to_string(),
                notification.from_user_id.map(|u| u.to_string()),
                notification.title,
                notification.body,
                notification.kind.as_str(),
                notification.related_entity,
                notification.is_read,
                notification.read_at.map(|t| t.to_rfc3339()),
                notification.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// One page of the user's notifications, newest first.
    pub fn list_notifications(
        &self,
        user: UserId,
        limit: u32,
        offset: u32,
        unread_only: bool,
    ) -> Result<Vec<Notification>> {
        let filter = if unread_only { "AND is_read = 0" } else { "" };
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications
             WHERE user_id = ?1 {filter}
             ORDER BY created_at DESC
             LIMIT ?2 OFFSET ?3"
        ))?;

        let rows = stmt.query_map(
            params![user.to_string(), limit, offset],
            row_to_notification,
        )?;

        let mut notifications = Vec::new();
        for row in rows {
            notifications.push(row?);
        }
        Ok(notifications)
    }

    pub fn count_notifications(&self, user: UserId, unread_only: bool) -> Result<i64> {
        let filter = if unread_only { "AND is_read = 0" } else { "" };
        let count = self.conn().query_row(
            &format!("SELECT COUNT(*) FROM notifications WHERE user_id = ?1 {filter}"),
            params![user.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Owner-scoped existence check.
    pub fn notification_exists(&self, id: NotificationId, user: UserId) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM notifications WHERE id = ?1 AND user_id = ?2",
            params![id.to_string(), user.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Flip one notification to read. Owner-scoped; returns `true` only if
    /// an unread notification owned by `user` existed.
    pub fn mark_notification_read(
        &self,
        id: NotificationId,
        user: UserId,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE notifications SET is_read = 1, read_at = ?3
             WHERE id = ?1 AND user_id = ?2 AND is_read = 0",
            params![id.to_string(), user.to_string(), at.to_rfc3339()],
        )?;
        Ok(affected > 0)
    }

    /// Mark every unread notification read; returns how many flipped.
    pub fn mark_all_notifications_read(&self, user: UserId, at: DateTime<Utc>) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE notifications SET is_read = 1, read_at = ?2
             WHERE user_id = ?1 AND is_read = 0",
            params![user.to_string(), at.to_rfc3339()],
        )?;
        Ok(affected)
    }

    /// Delete one notification, owner-scoped. Returns `true` if a row was
    /// deleted.
    pub fn delete_notification(&self, id: NotificationId, user: UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM notifications WHERE id = ?1 AND user_id = ?2",
            params![id.to_string(), user.to_string()],
        )?;
        Ok(affected > 0)
    }
}

/// Map a `rusqlite::Row` to a [`Notification`].
fn row_to_notification(row: &rusqlite::Row<'_>) -> rusqlite::Result<Notification> {
    let id_str: String = row.get(0)?;
    let user_str: String = row.get(1)?;
    let from_str: Option<String> = row.get(2)?;
    let kind_str: String = row.get(5)?;
    let read_at_str: Option<String> = row.get(8)?;
    let created_str: String = row.get(9)?;

    let from_user_id = from_str
        .map(|s| parse_uuid(2, &s).map(UserId))
        .transpose()?;

    Ok(Notification {
        id: NotificationId(parse_uuid(0, &id_str)?),
        user_id: UserId(parse_uuid(1, &user_str)?),
        from_user_id,
        title: row.get(3)?,
        body: row.get(4)?,
        kind: parse_kind(5, &kind_str, NotificationKind::parse)?,
        related_entity: row.get(6)?,
        is_read: row.get(7)?,
        read_at: parse_opt_ts(8, read_at_str)?,
        created_at: parse_ts(9, &created_str)?,
    })
}
