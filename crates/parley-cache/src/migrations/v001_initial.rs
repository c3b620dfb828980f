//! v001 -- Initial schema creation.
//!
//! Both tables hold JSON-encoded domain models keyed by the viewing user, with
//! an explicit `position` so the backend order survives a round-trip.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Conversation list, one snapshot per viewer
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    viewer_id  TEXT NOT NULL,
    id         TEXT NOT NULL,
    position   INTEGER NOT NULL,
    json       TEXT NOT NULL,
    updated_at TEXT NOT NULL,                -- RFC-3339
    cached_at  TEXT NOT NULL,

    PRIMARY KEY (viewer_id, id)
);

CREATE INDEX IF NOT EXISTS idx_conversations_viewer_pos
    ON conversations(viewer_id, position);

-- ----------------------------------------------------------------
-- Message pages, one per viewer and conversation
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    viewer_id       TEXT NOT NULL,
    conversation_id TEXT NOT NULL,
    id              TEXT NOT NULL,
    position        INTEGER NOT NULL,
    json            TEXT NOT NULL,
    timestamp       TEXT NOT NULL,           -- RFC-3339
    cached_at       TEXT NOT NULL,

    PRIMARY KEY (viewer_id, conversation_id, id)
);

CREATE INDEX IF NOT EXISTS idx_messages_viewer_conv_pos
    ON messages(viewer_id, conversation_id, position);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
