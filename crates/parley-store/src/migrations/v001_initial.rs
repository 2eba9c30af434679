//! v001 -- Initial schema creation.
//!
//! The uniqueness constraints on `conversations`, `group_members` and
//! `message_media` are load-bearing: the conversation resolver and the
//! membership/attachment paths rely on them to enforce their invariants.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id          TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    username    TEXT NOT NULL UNIQUE,
    full_name   TEXT,
    bio         TEXT,
    avatar_url  TEXT,
    is_online   INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1, presence tracker only
    last_seen   TEXT,                        -- ISO-8601 / RFC-3339
    created_at  TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Bearer credentials (written by the external account system)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS auth_tokens (
    token      TEXT PRIMARY KEY NOT NULL,    -- 32 hex chars, random
    user_id    TEXT NOT NULL,
    created_at TEXT NOT NULL,

    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Live-session mirror (advisory; routing never reads this)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS sessions (
    connection_id TEXT PRIMARY KEY NOT NULL, -- UUID v4
    user_id       TEXT NOT NULL,
    connected_at  TEXT NOT NULL,

    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_sessions_user_id ON sessions(user_id);

-- ----------------------------------------------------------------
-- Conversations (unordered pair; at most one row per pair)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id              TEXT PRIMARY KEY NOT NULL,
    user_a          TEXT NOT NULL,
    user_b          TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    last_message_at TEXT,

    FOREIGN KEY (user_a) REFERENCES users(id),
    FOREIGN KEY (user_b) REFERENCES users(id),
    UNIQUE (user_a, user_b)
);

-- ----------------------------------------------------------------
-- Groups
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS groups (
    id          TEXT PRIMARY KEY NOT NULL,
    name        TEXT NOT NULL,
    description TEXT,
    created_by  TEXT NOT NULL,
    created_at  TEXT NOT NULL,

    FOREIGN KEY (created_by) REFERENCES users(id)
);

CREATE TABLE IF NOT EXISTS group_members (
    id        TEXT PRIMARY KEY NOT NULL,
    group_id  TEXT NOT NULL,
    user_id   TEXT NOT NULL,
    is_admin  INTEGER NOT NULL DEFAULT 0,
    joined_at TEXT NOT NULL,

    FOREIGN KEY (group_id) REFERENCES groups(id) ON DELETE CASCADE,
    FOREIGN KEY (user_id)  REFERENCES users(id)  ON DELETE CASCADE,
    UNIQUE (group_id, user_id)
);

CREATE INDEX IF NOT EXISTS idx_group_members_user_id ON group_members(user_id);

-- ----------------------------------------------------------------
-- Messages (exactly one of conversation_id / group_id is set)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id                  TEXT PRIMARY KEY NOT NULL,
    content             TEXT NOT NULL,
    sender_id           TEXT NOT NULL,
    conversation_id     TEXT,
    group_id            TEXT,
    kind                TEXT NOT NULL,       -- text | media | system
    is_read             INTEGER NOT NULL DEFAULT 0,
    read_at             TEXT,
    is_deleted          INTEGER NOT NULL DEFAULT 0,
    reply_to_message_id TEXT,
    sent_at             TEXT NOT NULL,

    FOREIGN KEY (sender_id)           REFERENCES users(id)         ON DELETE CASCADE,
    FOREIGN KEY (conversation_id)     REFERENCES conversations(id) ON DELETE CASCADE,
    FOREIGN KEY (group_id)            REFERENCES groups(id)        ON DELETE CASCADE,
    FOREIGN KEY (reply_to_message_id) REFERENCES messages(id)      ON DELETE SET NULL,
    CHECK ((conversation_id IS NULL) != (group_id IS NULL))
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts
    ON messages(conversation_id, sent_at DESC);
CREATE INDEX IF NOT EXISTS idx_messages_group_ts
    ON messages(group_id, sent_at DESC);
CREATE INDEX IF NOT EXISTS idx_messages_sender_id ON messages(sender_id);

-- ----------------------------------------------------------------
-- Media (file metadata; files live on disk)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS media (
    id             TEXT PRIMARY KEY NOT NULL,
    file_name      TEXT NOT NULL,
    file_path      TEXT NOT NULL,
    content_type   TEXT NOT NULL,
    file_size      INTEGER NOT NULL,
    kind           TEXT NOT NULL,            -- image | video | document
    thumbnail_path TEXT,
    uploaded_by    TEXT NOT NULL,
    uploaded_at    TEXT NOT NULL,

    FOREIGN KEY (uploaded_by) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_media_uploaded_by ON media(uploaded_by);

CREATE TABLE IF NOT EXISTS message_media (
    id         TEXT PRIMARY KEY NOT NULL,
    message_id TEXT NOT NULL,
    media_id   TEXT NOT NULL,

    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE,
    FOREIGN KEY (media_id)   REFERENCES media(id)    ON DELETE CASCADE,
    UNIQUE (message_id, media_id)
);

-- ----------------------------------------------------------------
-- Notifications
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS notifications (
    id             TEXT PRIMARY KEY NOT NULL,
    user_id        TEXT NOT NULL,
    from_user_id   TEXT,
    title          TEXT NOT NULL,
    body           TEXT,
    kind           TEXT NOT NULL,
    related_entity TEXT,
    is_read        INTEGER NOT NULL DEFAULT 0,
    read_at        TEXT,
    created_at     TEXT NOT NULL,

    FOREIGN KEY (user_id)      REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (from_user_id) REFERENCES users(id) ON DELETE SET NULL
);

CREATE INDEX IF NOT EXISTS idx_notifications_user_id    ON notifications(user_id);
CREATE INDEX IF NOT EXISTS idx_notifications_is_read    ON notifications(is_read);
CREATE INDEX IF NOT EXISTS idx_notifications_created_at ON notifications(created_at);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
