//! Conversation records and the resolve-or-create path.
//!
//! Storage is keyed on the ordered pair with a `UNIQUE (user_a, user_b)`
//! constraint, so the resolver always checks both orderings and tolerates
//! a constraint violation from a concurrent first contact by re-reading.

use chrono::{DateTime, Utc};
use rusqlite::params;

use parley_shared::{ConversationId, ConversationSummary, UserId};

use crate::database::{is_constraint_violation, parse_opt_ts, parse_ts, parse_uuid, Database};
use crate::error::{Result, StoreError};
use crate::models::Conversation;

impl Database {
    /// Look up the conversation between two users, in either ordering.
    pub fn find_conversation_between(
        &self,
        user_a: UserId,
        user_b: UserId,
    ) -> Result<Option<Conversation>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, user_a, user_b, created_at, last_message_at
             FROM conversations
             WHERE (user_a = ?1 AND user_b = ?2) OR (user_a = ?2 AND user_b = ?1)",
        )?;

        let mut rows = stmt.query_map(
            params![user_a.to_string(), user_b.to_string()],
            row_to_conversation,
        )?;

        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Resolve the conversation for an unordered pair, creating it on first
    /// contact. The check-then-create runs inside a transaction; a UNIQUE
    /// violation from a concurrent creation is answered by re-reading, so
    /// two racing first contacts can never produce two conversations.
    pub fn find_or_create_conversation(
        &self,
        user_a: UserId,
        user_b: UserId,
    ) -> Result<Conversation> {
        let tx = self.conn().unchecked_transaction()?;

        if let Some(existing) = self.find_conversation_between(user_a, user_b)? {
            tx.commit()?;
            return Ok(existing);
        }

        let conversation = Conversation {
            id: ConversationId::new(),
            user_a,
            user_b,
            created_at: Utc::now(),
            last_message_at: None,
        };

        let inserted = tx.execute(
            "INSERT INTO conversations (id, user_a, user_b, created_at, last_message_at)
             VALUES (?1, ?2, ?3, ?4, NULL)",
            params![
                conversation.id.to_string(),
                conversation.user_a.to_string(),
                conversation.user_b.to_string(),
                conversation.created_at.to_rfc3339(),
            ],
        );

        match inserted {
            Ok(_) => {
                tx.commit()?;
                Ok(conversation)
            }
            Err(e) if is_constraint_violation(&e) => {
                drop(tx);
                self.find_conversation_between(user_a, user_b)?
                    .ok_or(StoreError::NotFound)
            }
            Err(e) => Err(StoreError::Sqlite(e)),
        }
    }

    /// Fetch a conversation by id.
    pub fn get_conversation(&self, id: ConversationId) -> Result<Conversation> {
        self.conn()
            .query_row(
                "SELECT id, user_a, user_b, created_at, last_message_at
                 FROM conversations WHERE id = ?1",
                params![id.to_string()],
                row_to_conversation,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// The caller's conversation list with previews, ordered by
    /// last-message-at descending.
    pub fn list_conversations_for(&self, user: UserId) -> Result<Vec<ConversationSummary>> {
        let mut stmt = self.conn().prepare(
            "SELECT c.id,
                    u.id, u.username, u.is_online,
                    (SELECT m.content FROM messages m
                     WHERE m.conversation_id = c.id AND m.is_deleted = 0
                     ORDER BY m.sent_at DESC LIMIT 1),
                    c.last_message_at,
                    (SELECT COUNT(*) FROM messages m
                     WHERE m.conversation_id = c.id
                       AND m.sender_id != ?1
                       AND m.is_read = 0
                       AND m.is_deleted = 0)
             FROM conversations c
             JOIN users u
               ON u.id = CASE WHEN c.user_a = ?1 THEN c.user_b ELSE c.user_a END
             WHERE c.user_a = ?1 OR c.user_b = ?1
             ORDER BY c.last_message_at IS NULL, c.last_message_at DESC",
        )?;

        let rows = stmt.query_map(params![user.to_string()], |row| {
            let id_str: String = row.get(0)?;
            let other_id_str: String = row.get(1)?;
            let last_message_at: Option<String> = row.get(5)?;

            Ok(ConversationSummary {
                id: ConversationId(parse_uuid(0, &id_str)?),
                other_user_id: UserId(parse_uuid(1, &other_id_str)?),
                other_user_name: row.get(2)?,
                other_user_online: row.get(3)?,
                last_message: row.get(4)?,
                last_message_at: parse_opt_ts(5, last_message_at)?,
                unread_count: row.get(6)?,
            })
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(row?);
        }
        Ok(summaries)
    }

    /// Stamp the conversation's last-message timestamp.
    pub fn touch_conversation(&self, id: ConversationId, at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE conversations SET last_message_at = ?2 WHERE id = ?1",
            params![id.to_string(), at.to_rfc3339()],
        )?;
        Ok(())
    }
}

/// Map a `rusqlite::Row` to a [`Conversation`].
fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let id_str: String = row.get(0)?;
    let user_a_str: String = row.get(1)?;
    let user_b_str: String = row.get(2)?;
    let created_str: String = row.get(3)?;
    let last_message_at: Option<String> = row.get(4)?;

    Ok(Conversation {
        id: ConversationId(parse_uuid(0, &id_str)?),
        user_a: UserId(parse_uuid(1, &user_a_str)?),
        user_b: UserId(parse_uuid(2, &user_b_str)?),
        created_at: parse_ts(3, &created_str)?,
        last_message_at: parse_opt_ts(4, last_message_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::tests::{open_test_db, sample_user};

    #[test]
    fn test_find_or_create_is_stable_across_orderings() {
        let (db, _dir) = open_test_db();
        let alice = sample_user("alice");
        let bob = sample_user("bob");
        db.create_user(&alice).unwrap();
        db.create_user(&bob).unwrap();

        let first = db.find_or_create_conversation(alice.id, bob.id).unwrap();
        let second = db.find_or_create_conversation(bob.id, alice.id).unwrap();
        assert_eq!(first.id, second.id);

        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM conversations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_unique_constraint_backs_the_pair_invariant() {
        let (db, _dir) = open_test_db();
        let alice = sample_user("alice");
        let bob = sample_user("bob");
        db.create_user(&alice).unwrap();
        db.create_user(&bob).unwrap();

        let existing = db.find_or_create_conversation(alice.id, bob.id).unwrap();

        // Simulate the losing side of a create race: direct insert of the
        // same ordered pair must hit the constraint.
        let duplicate = db.conn().execute(
            "INSERT INTO conversations (id, user_a, user_b, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                ConversationId::new().to_string(),
                existing.user_a.to_string(),
                existing.user_b.to_string(),
                Utc::now().to_rfc3339(),
            ],
        );
        assert!(duplicate.is_err());
    }

    #[test]
    fn test_other_participant() {
        let (db, _dir) = open_test_db();
        let alice = sample_user("alice");
        let bob = sample_user("bob");
        db.create_user(&alice).unwrap();
        db.create_user(&bob).unwrap();

        let conversation = db.find_or_create_conversation(alice.id, bob.id).unwrap();
        assert_eq!(conversation.other_participant(alice.id), bob.id);
        assert_eq!(conversation.other_participant(bob.id), alice.id);
        assert!(conversation.has_participant(alice.id));
    }

    #[test]
    fn test_touch_updates_last_message_at() {
        let (db, _dir) = open_test_db();
        let alice = sample_user("alice");
        let bob = sample_user("bob");
        db.create_user(&alice).unwrap();
        db.create_user(&bob).unwrap();

        let conversation = db.find_or_create_conversation(alice.id, bob.id).unwrap();
        assert!(conversation.last_message_at.is_none());

        db.touch_conversation(conversation.id, Utc::now()).unwrap();
        let fetched = db.get_conversation(conversation.id).unwrap();
        assert!(fetched.last_message_at.is_some());
    }
}
