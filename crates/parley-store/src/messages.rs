//! Message records, the message-media join, and history/search queries.
//!
//! History pages are fetched newest-first; callers reverse the page before
//! display so the final order is oldest-first.

use chrono::{DateTime, Utc};
use rusqlite::{params, ToSql};
use uuid::Uuid;

use parley_shared::{
    ConversationId, GroupId, MediaId, MessageId, MessageKind, MessageTarget, UserId,
};

use crate::database::{parse_kind, parse_opt_ts, parse_ts, parse_uuid, Database};
use crate::error::{Result, StoreError};
use crate::models::{Media, Message};

const MESSAGE_COLUMNS: &str = "id, content, sender_id, conversation_id, group_id, kind, \
                               is_read, read_at, is_deleted, reply_to_message_id, sent_at";

/// Filters for the scoped message search.
#[derive(Debug, Clone, Default)]
pub struct MessageSearch {
    pub term: Option<String>,
    pub conversation_id: Option<ConversationId>,
    pub group_id: Option<GroupId>,
    pub sender_id: Option<UserId>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Persist a message together with its media joins, and stamp the
    /// conversation's last-message timestamp for direct messages. The
    /// whole write commits or rolls back as a unit.
    pub fn insert_message(&self, message: &Message, media_ids: &[MediaId]) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;

        tx.execute(
            &format!(
                "INSERT INTO messages ({MESSAGE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                message.id.to_string(),
                message.content,
                message.sender_id.to_string(),
                message.target.conversation_id().map(|c| c.to_string()),
                message.target.group_id().map(|g| g.to_string()),
                message.kind.as_str(),
                message.is_read,
                message.read_at.map(|t| t.to_rfc3339()),
                message.is_deleted,
                message.reply_to.map(|m| m.to_string()),
                message.sent_at.to_rfc3339(),
            ],
        )?;

        for media_id in media_ids {
            tx.execute(
                "INSERT OR IGNORE INTO message_media (id, message_id, media_id)
                 VALUES (?1, ?2, ?3)",
                params![
                    Uuid::new_v4().to_string(),
                    message.id.to_string(),
                    media_id.to_string(),
                ],
            )?;
        }

        if let Some(conversation_id) = message.target.conversation_id() {
            tx.execute(
                "UPDATE conversations SET last_message_at = ?2 WHERE id = ?1",
                params![conversation_id.to_string(), message.sent_at.to_rfc3339()],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single message by id.
    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// One page of a conversation's history, newest first.
    pub fn conversation_messages(
        &self,
        conversation: ConversationId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?1
             ORDER BY sent_at DESC
             LIMIT ?2 OFFSET ?3"
        ))?;

        let rows = stmt.query_map(
            params![conversation.to_string(), limit, offset],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// One page of a group's history, newest first.
    pub fn group_messages(&self, group: GroupId, limit: u32, offset: u32) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE group_id = ?1
             ORDER BY sent_at DESC
             LIMIT ?2 OFFSET ?3"
        ))?;

        let rows = stmt.query_map(params![group.to_string(), limit, offset], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Scoped full-text search. Only messages in conversations the caller
    /// participates in or groups the caller belongs to are considered,
    /// regardless of the requested filters. Returns one page (newest
    /// first) and the total hit count.
    pub fn search_messages(
        &self,
        caller: UserId,
        search: &MessageSearch,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<Message>, i64)> {
        let mut clauses: Vec<String> = vec![
            "m.is_deleted = 0".to_string(),
            "(m.conversation_id IN (SELECT c.id FROM conversations c
                                    WHERE c.user_a = :caller OR c.user_b = :caller)
              OR m.group_id IN (SELECT gm.group_id FROM group_members gm
                                WHERE gm.user_id = :caller))"
                .to_string(),
        ];
        let mut bindings: Vec<(&str, Box<dyn ToSql>)> =
            vec![(":caller", Box::new(caller.to_string()))];

        if let Some(term) = &search.term {
            clauses.push("m.content LIKE :term ESCAPE '\\'".to_string());
            let pattern = format!("%{}%", crate::users::escape_like(term));
            bindings.push((":term", Box::new(pattern)));
        }
        if let Some(conversation_id) = search.conversation_id {
            clauses.push("m.conversation_id = :conversation".to_string());
            bindings.push((":conversation", Box::new(conversation_id.to_string())));
        }
        if let Some(group_id) = search.group_id {
            clauses.push("m.group_id = :group".to_string());
            bindings.push((":group", Box::new(group_id.to_string())));
        }
        if let Some(sender_id) = search.sender_id {
            clauses.push("m.sender_id = :sender".to_string());
            bindings.push((":sender", Box::new(sender_id.to_string())));
        }
        if let Some(from) = search.from {
            clauses.push("m.sent_at >= :from".to_string());
            bindings.push((":from", Box::new(from.to_rfc3339())));
        }
        if let Some(to) = search.to {
            clauses.push("m.sent_at <= :to".to_string());
            bindings.push((":to", Box::new(to.to_rfc3339())));
        }

        let where_clause = clauses.join(" AND ");
        let named: Vec<(&str, &dyn ToSql)> = bindings
            .iter()
            .map(|(name, value)| (*name, value.as_ref()))
            .collect();

        let total: i64 = self.conn().query_row(
            &format!("SELECT COUNT(*) FROM messages m WHERE {where_clause}"),
            named.as_slice(),
            |row| row.get(0),
        )?;

        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages m
             WHERE {where_clause}
             ORDER BY m.sent_at DESC
             LIMIT {limit} OFFSET {offset}"
        ))?;

        let rows = stmt.query_map(named.as_slice(), row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok((messages, total))
    }

    /// Media attached to a message, each with its uploader's display name,
    /// in attachment order.
    pub fn media_for_message(&self, message: MessageId) -> Result<Vec<(Media, String)>> {
        let mut stmt = self.conn().prepare(
            "SELECT md.id, md.file_name, md.file_path, md.content_type, md.file_size,
                    md.kind, md.thumbnail_path, md.uploaded_by, md.uploaded_at,
                    u.username
             FROM message_media mm
             JOIN media md ON md.id = mm.media_id
             JOIN users u  ON u.id = md.uploaded_by
             WHERE mm.message_id = ?1
             ORDER BY mm.rowid ASC",
        )?;

        let rows = stmt.query_map(params![message.to_string()], |row| {
            let media = crate::media::row_to_media(row)?;
            let uploader: String = row.get(9)?;
            Ok((media, uploader))
        })?;

        let mut media = Vec::new();
        for row in rows {
            media.push(row?);
        }
        Ok(media)
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Flip the read flag. Returns `true` only on the first transition, so
    /// the caller can make the read-confirmation push idempotent.
    pub fn mark_message_read(&self, id: MessageId, at: DateTime<Utc>) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET is_read = 1, read_at = ?2
             WHERE id = ?1 AND is_read = 0",
            params![id.to_string(), at.to_rfc3339()],
        )?;
        Ok(affected > 0)
    }

    /// Soft-delete. Content stays in place; hydration blanks it. Returns
    /// `true` if the flag flipped.
    pub fn soft_delete_message(&self, id: MessageId) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET is_deleted = 1 WHERE id = ?1 AND is_deleted = 0",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }
}

/// Map a `rusqlite::Row` to a [`Message`]. The CHECK constraint guarantees
/// exactly one of the two target columns is set.
fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let sender_str: String = row.get(2)?;
    let conversation_str: Option<String> = row.get(3)?;
    let group_str: Option<String> = row.get(4)?;
    let kind_str: String = row.get(5)?;
    let read_at_str: Option<String> = row.get(7)?;
    let reply_str: Option<String> = row.get(9)?;
    let sent_str: String = row.get(10)?;

    let target = match (conversation_str, group_str) {
        (Some(c), None) => MessageTarget::Direct {
            conversation_id: ConversationId(parse_uuid(3, &c)?),
        },
        (None, Some(g)) => MessageTarget::Group {
            group_id: GroupId(parse_uuid(4, &g)?),
        },
        _ => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                "message row violates the conversation-xor-group invariant".into(),
            ))
        }
    };

    let reply_to = reply_str
        .map(|s| parse_uuid(9, &s).map(MessageId))
        .transpose()?;

    Ok(Message {
        id: MessageId(parse_uuid(0, &id_str)?),
        content: row.get(1)?,
        sender_id: UserId(parse_uuid(2, &sender_str)?),
        target,
        kind: parse_kind(5, &kind_str, MessageKind::parse)?,
        is_read: row.get(6)?,
        read_at: parse_opt_ts(7, read_at_str)?,
        is_deleted: row.get(8)?,
        reply_to,
        sent_at: parse_ts(10, &sent_str)?,
    })
}
