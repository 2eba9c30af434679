//! Group and membership records.
//!
//! Membership carries the admin flag; the creator is inserted as an admin
//! member in the same transaction that creates the group. Removing the
//! last admin promotes the earliest-joined remaining member so a group can
//! never end up admin-less while it still has members.

use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use parley_shared::{GroupId, UserId};

use crate::database::{parse_ts, parse_uuid, Database};
use crate::error::{Result, StoreError};
use crate::models::{Group, GroupMemberProfile, GroupOverview};

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a group together with its initial membership. The creator
    /// always becomes an admin member; duplicates and the creator are
    /// filtered out of `member_ids`.
    pub fn create_group(&self, group: &Group, member_ids: &[UserId]) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;

        tx.execute(
            "INSERT INTO groups (id, name, description, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                group.id.to_string(),
                group.name,
                group.description,
                group.created_by.to_string(),
                group.created_at.to_rfc3339(),
            ],
        )?;

        tx.execute(
            "INSERT INTO group_members (id, group_id, user_id, is_admin, joined_at)
             VALUES (?1, ?2, ?3, 1, ?4)",
            params![
                Uuid::new_v4().to_string(),
                group.id.to_string(),
                group.created_by.to_string(),
                group.created_at.to_rfc3339(),
            ],
        )?;

        for member in member_ids {
            if *member == group.created_by {
                continue;
            }
            tx.execute(
                "INSERT OR IGNORE INTO group_members (id, group_id, user_id, is_admin, joined_at)
                 VALUES (?1, ?2, ?3, 0, ?4)",
                params![
                    Uuid::new_v4().to_string(),
                    group.id.to_string(),
                    member.to_string(),
                    group.created_at.to_rfc3339(),
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single group by id.
    pub fn get_group(&self, id: GroupId) -> Result<Group> {
        self.conn()
            .query_row(
                "SELECT id, name, description, created_by, created_at
                 FROM groups WHERE id = ?1",
                params![id.to_string()],
                row_to_group,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Groups the user belongs to, with creator name and member count.
    pub fn list_groups_for(&self, user: UserId) -> Result<Vec<GroupOverview>> {
        let mut stmt = self.conn().prepare(
            "SELECT g.id, g.name, g.description, g.created_by, g.created_at,
                    u.username,
                    (SELECT COUNT(*) FROM group_members m WHERE m.group_id = g.id)
             FROM group_members gm
             JOIN groups g ON g.id = gm.group_id
             JOIN users u  ON u.id = g.created_by
             WHERE gm.user_id = ?1
             ORDER BY g.created_at DESC",
        )?;

        let rows = stmt.query_map(params![user.to_string()], |row| {
            Ok(GroupOverview {
                group: row_to_group(row)?,
                created_by_name: row.get(5)?,
                member_count: row.get(6)?,
            })
        })?;

        let mut overviews = Vec::new();
        for row in rows {
            overviews.push(row?);
        }
        Ok(overviews)
    }

    /// Creator name and member count for one group.
    pub fn group_overview(&self, id: GroupId) -> Result<GroupOverview> {
        self.conn()
            .query_row(
                "SELECT g.id, g.name, g.description, g.created_by, g.created_at,
                        u.username,
                        (SELECT COUNT(*) FROM group_members m WHERE m.group_id = g.id)
                 FROM groups g
                 JOIN users u ON u.id = g.created_by
                 WHERE g.id = ?1",
                params![id.to_string()],
                |row| {
                    Ok(GroupOverview {
                        group: row_to_group(row)?,
                        created_by_name: row.get(5)?,
                        member_count: row.get(6)?,
                    })
                },
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    pub fn is_group_member(&self, group: GroupId, user: UserId) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM group_members WHERE group_id = ?1 AND user_id = ?2",
            params![group.to_string(), user.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn is_group_admin(&self, group: GroupId, user: UserId) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM group_members
             WHERE group_id = ?1 AND user_id = ?2 AND is_admin = 1",
            params![group.to_string(), user.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Current member ids. The message router calls this at send time; the
    /// result is the delivery membership snapshot.
    pub fn group_member_ids(&self, group: GroupId) -> Result<Vec<UserId>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT user_id FROM group_members WHERE group_id = ?1")?;

        let rows = stmt.query_map(params![group.to_string()], |row| {
            let id_str: String = row.get(0)?;
            Ok(UserId(parse_uuid(0, &id_str)?))
        })?;

        let mut members = Vec::new();
        for row in rows {
            members.push(row?);
        }
        Ok(members)
    }

    /// Member rows joined with directory fields, ordered by join date.
    pub fn list_group_members(&self, group: GroupId) -> Result<Vec<GroupMemberProfile>> {
        let mut stmt = self.conn().prepare(
            "SELECT gm.user_id, u.username, u.full_name, gm.is_admin, u.is_online, gm.joined_at
             FROM group_members gm
             JOIN users u ON u.id = gm.user_id
             WHERE gm.group_id = ?1
             ORDER BY gm.joined_at ASC",
        )?;

        let rows = stmt.query_map(params![group.to_string()], |row| {
            let id_str: String = row.get(0)?;
            let joined_str: String = row.get(5)?;
            Ok(GroupMemberProfile {
                user_id: UserId(parse_uuid(0, &id_str)?),
                username: row.get(1)?,
                full_name: row.get(2)?,
                is_admin: row.get(3)?,
                is_online: row.get(4)?,
                joined_at: parse_ts(5, &joined_str)?,
            })
        })?;

        let mut members = Vec::new();
        for row in rows {
            members.push(row?);
        }
        Ok(members)
    }

    /// Add a member. Returns `false` if the user was already a member.
    pub fn add_group_member(&self, group: GroupId, user: UserId, is_admin: bool) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO group_members (id, group_id, user_id, is_admin, joined_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Uuid::new_v4().to_string(),
                group.to_string(),
                user.to_string(),
                is_admin,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(affected > 0)
    }

    /// Remove a member. When the removed member was the last admin and
    /// members remain, the earliest-joined remaining member is promoted in
    /// the same transaction. Returns `false` if no such membership existed.
    pub fn remove_group_member(&self, group: GroupId, user: UserId) -> Result<bool> {
        let tx = self.conn().unchecked_transaction()?;

        let affected = tx.execute(
            "DELETE FROM group_members WHERE group_id = ?1 AND user_id = ?2",
            params![group.to_string(), user.to_string()],
        )?;
        if affected == 0 {
            return Ok(false);
        }

        let admins_left: i64 = tx.query_row(
            "SELECT COUNT(*) FROM group_members WHERE group_id = ?1 AND is_admin = 1",
            params![group.to_string()],
            |row| row.get(0),
        )?;

        if admins_left == 0 {
            tx.execute(
                "UPDATE group_members SET is_admin = 1
                 WHERE id = (SELECT id FROM group_members
                             WHERE group_id = ?1
                             ORDER BY joined_at ASC, id ASC LIMIT 1)",
                params![group.to_string()],
            )?;
        }

        tx.commit()?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete a group. Members and messages cascade. Returns `true` if a
    /// row was deleted.
    pub fn delete_group(&self, id: GroupId) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM groups WHERE id = ?1", params![id.to_string()])?;
        Ok(affected > 0)
    }
}

/// Map a `rusqlite::Row` to a [`Group`]. Expects the group columns first.
fn row_to_group(row: &rusqlite::Row<'_>) -> rusqlite::Result<Group> {
    let id_str: String = row.get(0)?;
    let created_by_str: String = row.get(3)?;
    let created_str: String = row.get(4)?;

    Ok(Group {
        id: GroupId(parse_uuid(0, &id_str)?),
        name: row.get(1)?,
        description: row.get(2)?,
        created_by: UserId(parse_uuid(3, &created_by_str)?),
        created_at: parse_ts(4, &created_str)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::tests::{open_test_db, sample_user};

    fn make_group(db: &Database, creator: UserId, members: &[UserId]) -> Group {
        let group = Group {
            id: GroupId::new(),
            name: "fellowship".to_string(),
            description: None,
            created_by: creator,
            created_at: Utc::now(),
        };
        db.create_group(&group, members).unwrap();
        group
    }

    #[test]
    fn test_creator_is_admin_member() {
        let (db, _dir) = open_test_db();
        let alice = sample_user("alice");
        let bob = sample_user("bob");
        db.create_user(&alice).unwrap();
        db.create_user(&bob).unwrap();

        let group = make_group(&db, alice.id, &[bob.id, alice.id]);

        assert!(db.is_group_member(group.id, alice.id).unwrap());
        assert!(db.is_group_admin(group.id, alice.id).unwrap());
        assert!(db.is_group_member(group.id, bob.id).unwrap());
        assert!(!db.is_group_admin(group.id, bob.id).unwrap());

        // the creator appears once even though it was also in member_ids
        assert_eq!(db.group_member_ids(group.id).unwrap().len(), 2);
    }

    #[test]
    fn test_duplicate_membership_rejected() {
        let (db, _dir) = open_test_db();
        let alice = sample_user("alice");
        let bob = sample_user("bob");
        db.create_user(&alice).unwrap();
        db.create_user(&bob).unwrap();

        let group = make_group(&db, alice.id, &[]);
        assert!(db.add_group_member(group.id, bob.id, false).unwrap());
        assert!(!db.add_group_member(group.id, bob.id, false).unwrap());
    }

    #[test]
    fn test_last_admin_removal_promotes_earliest_member() {
        let (db, _dir) = open_test_db();
        let alice = sample_user("alice");
        let bob = sample_user("bob");
        let carol = sample_user("carol");
        for u in [&alice, &bob, &carol] {
            db.create_user(u).unwrap();
        }

        let group = make_group(&db, alice.id, &[]);
        db.add_group_member(group.id, bob.id, false).unwrap();
        db.add_group_member(group.id, carol.id, false).unwrap();

        assert!(db.remove_group_member(group.id, alice.id).unwrap());

        // bob joined before carol, so bob is promoted
        assert!(db.is_group_admin(group.id, bob.id).unwrap());
        assert!(!db.is_group_admin(group.id, carol.id).unwrap());
    }

    #[test]
    fn test_removing_non_admin_promotes_nobody() {
        let (db, _dir) = open_test_db();
        let alice = sample_user("alice");
        let bob = sample_user("bob");
        db.create_user(&alice).unwrap();
        db.create_user(&bob).unwrap();

        let group = make_group(&db, alice.id, &[bob.id]);
        assert!(db.remove_group_member(group.id, bob.id).unwrap());

        let members = db.list_group_members(group.id).unwrap();
        assert_eq!(members.len(), 1);
        assert!(members[0].is_admin);
    }

    #[test]
    fn test_remove_missing_member_is_noop() {
        let (db, _dir) = open_test_db();
        let alice = sample_user("alice");
        let bob = sample_user("bob");
        db.create_user(&alice).unwrap();
        db.create_user(&bob).unwrap();

        let group = make_group(&db, alice.id, &[]);
        assert!(!db.remove_group_member(group.id, bob.id).unwrap());
    }

    #[test]
    fn test_delete_group_cascades_members() {
        let (db, _dir) = open_test_db();
        let alice = sample_user("alice");
        db.create_user(&alice).unwrap();

        let group = make_group(&db, alice.id, &[]);
        assert!(db.delete_group(group.id).unwrap());
        assert!(db.group_member_ids(group.id).unwrap().is_empty());
        assert!(db.list_groups_for(alice.id).unwrap().is_empty());
    }
}
