//! Media metadata records. The file bytes live on disk; rows here only
//! describe them.

use rusqlite::params;

use parley_shared::{MediaId, MediaKind, UserId};

use crate::database::{parse_kind, parse_ts, parse_uuid, Database};
use crate::error::{Result, StoreError};
use crate::models::Media;

const MEDIA_COLUMNS: &str = "id, file_name, file_path, content_type, file_size, kind, \
                             thumbnail_path, uploaded_by, uploaded_at";

impl Database {
    /// Insert a media record.
    pub fn insert_media(&self, media: &Media) -> Result<()> {
        self.conn().execute(
            &format!(
                "INSERT INTO media ({MEDIA_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            params![
                media.id.to_string(),
                media.file_name,
                media.file_path,
                media.content_type,
                media.file_size,
                media.kind.as_str(),
                media.thumbnail_path,
                media.uploaded_by.to_string(),
                media.uploaded_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Fetch a single media record by id.
    pub fn get_media(&self, id: MediaId) -> Result<Media> {
        self.conn()
            .query_row(
                &format!("SELECT {MEDIA_COLUMNS} FROM media WHERE id = ?1"),
                params![id.to_string()],
                row_to_media,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Of the requested ids, return only those uploaded by `owner`,
    /// preserving the requested order. Backs the attachment ownership
    /// check: references that fail it are simply absent from the result.
    pub fn media_owned_by(&self, ids: &[MediaId], owner: UserId) -> Result<Vec<Media>> {
        let mut owned = Vec::new();
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MEDIA_COLUMNS} FROM media WHERE id = ?1 AND uploaded_by = ?2"
        ))?;

        for id in ids {
            let mut rows =
                stmt.query_map(params![id.to_string(), owner.to_string()], row_to_media)?;
            if let Some(row) = rows.next() {
                owned.push(row?);
            }
        }
        Ok(owned)
    }

    /// Delete a media record. Joins cascade. Returns `true` if a row was
    /// deleted.
    pub fn delete_media(&self, id: MediaId) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM media WHERE id = ?1", params![id.to_string()])?;
        Ok(affected > 0)
    }
}

/// Map a `rusqlite::Row` to a [`Media`]. Expects the media columns first.
pub(crate) fn row_to_media(row: &rusqlite::Row<'_>) -> rusqlite::Result<Media> {
    let id_str: String = row.get(0)?;
    let kind_str: String = row.get(5)?;
    let uploaded_by_str: String = row.get(7)?;
    let uploaded_str: String = row.get(8)?;

    Ok(Media {
        id: MediaId(parse_uuid(0, &id_str)?),
        file_name: row.get(1)?,
        file_path: row.get(2)?,
        content_type: row.get(3)?,
        file_size: row.get(4)?,
        kind: parse_kind(5, &kind_str, MediaKind::parse)?,
        thumbnail_path: row.get(6)?,
        uploaded_by: UserId(parse_uuid(7, &uploaded_by_str)?),
        uploaded_at: parse_ts(8, &uploaded_str)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::users::tests::{open_test_db, sample_user};
    use chrono::Utc;

    pub(crate) fn sample_media(uploader: UserId) -> Media {
        Media {
            id: MediaId::new(),
            file_name: "photo.png".to_string(),
            file_path: format!("{}.png", uuid::Uuid::new_v4()),
            content_type: "image/png".to_string(),
            file_size: 2048,
            kind: MediaKind::Image,
            thumbnail_path: None,
            uploaded_by: uploader,
            uploaded_at: Utc::now(),
        }
    }

    #[test]
    fn test_insert_and_get() {
        let (db, _dir) = open_test_db();
        let alice = sample_user("alice");
        db.create_user(&alice).unwrap();

        let media = sample_media(alice.id);
        db.insert_media(&media).unwrap();

        let fetched = db.get_media(media.id).unwrap();
        assert_eq!(fetched, media);
    }

    #[test]
    fn test_media_owned_by_drops_foreign_ids() {
        let (db, _dir) = open_test_db();
        let alice = sample_user("alice");
        let mallory = sample_user("mallory");
        db.create_user(&alice).unwrap();
        db.create_user(&mallory).unwrap();

        let mine = sample_media(alice.id);
        let theirs = sample_media(mallory.id);
        db.insert_media(&mine).unwrap();
        db.insert_media(&theirs).unwrap();

        let owned = db
            .media_owned_by(&[theirs.id, mine.id, MediaId::new()], alice.id)
            .unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].id, mine.id);
    }

    #[test]
    fn test_delete() {
        let (db, _dir) = open_test_db();
        let alice = sample_user("alice");
        db.create_user(&alice).unwrap();

        let media = sample_media(alice.id);
        db.insert_media(&media).unwrap();

        assert!(db.delete_media(media.id).unwrap());
        assert!(!db.delete_media(media.id).unwrap());
        assert!(db.get_media(media.id).is_err());
    }
}
