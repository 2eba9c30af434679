//! Bearer credential lookup.
//!
//! Tokens are opaque 128-bit random values written by the external account
//! system; the server only ever resolves them to an identity.

use chrono::{DateTime, Utc};
use rusqlite::params;

use parley_shared::UserId;

use crate::database::{parse_uuid, Database};
use crate::error::Result;

impl Database {
    /// Register a bearer token for a user.
    pub fn insert_auth_token(&self, token: &str, user: UserId, at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO auth_tokens (token, user_id, created_at)
             VALUES (?1, ?2, ?3)",
            params![token, user.to_string(), at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Resolve a bearer token to its identity, if any.
    pub fn user_for_token(&self, token: &str) -> Result<Option<UserId>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT user_id FROM auth_tokens WHERE token = ?1")?;

        let mut rows = stmt.query_map(params![token], |row| {
            let user_str: String = row.get(0)?;
            Ok(UserId(parse_uuid(0, &user_str)?))
        })?;

        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Revoke every token owned by a user.
    pub fn delete_auth_tokens_for(&self, user: UserId) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM auth_tokens WHERE user_id = ?1",
            params![user.to_string()],
        )?;
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::tests::{open_test_db, sample_user};

    #[test]
    fn test_token_resolution() {
        let (db, _dir) = open_test_db();
        let alice = sample_user("alice");
        db.create_user(&alice).unwrap();

        db.insert_auth_token("deadbeefdeadbeefdeadbeefdeadbeef", alice.id, Utc::now())
            .unwrap();

        assert_eq!(
            db.user_for_token("deadbeefdeadbeefdeadbeefdeadbeef").unwrap(),
            Some(alice.id)
        );
        assert_eq!(db.user_for_token("unknown").unwrap(), None);
    }

    #[test]
    fn test_revocation() {
        let (db, _dir) = open_test_db();
        let alice = sample_user("alice");
        db.create_user(&alice).unwrap();

        db.insert_auth_token("token-a", alice.id, Utc::now()).unwrap();
        db.insert_auth_token("token-b", alice.id, Utc::now()).unwrap();

        assert_eq!(db.delete_auth_tokens_for(alice.id).unwrap(), 2);
        assert_eq!(db.user_for_token("token-a").unwrap(), None);
    }
}
