//! Database schema initialization.
//!
//! Two core tables plus a contentless-synced FTS5 projection. The FTS rows
//! are maintained by triggers inside the same transaction as the node write,
//! so readers observe either the pre- or post-update state, never a partial.

use rusqlite::Connection;

pub fn init_schema(conn: &mut Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS nodes (
            id TEXT PRIMARY KEY,
            type TEXT NOT NULL,
            label TEXT NOT NULL,
            content TEXT,
            properties TEXT NOT NULL DEFAULT '{}',
            embedding BLOB,
            created_at INTEGER NOT NULL,  -- unix microseconds
            updated_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_nodes_type ON nodes(type);
        CREATE INDEX IF NOT EXISTS idx_nodes_updated_at ON nodes(updated_at);

        CREATE TABLE IF NOT EXISTS edges (
            id INTEGER PRIMARY KEY,
            source_id TEXT NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
            target_id TEXT NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
            type TEXT NOT NULL,
            properties TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            UNIQUE(source_id, target_id, type)
        );

        CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source_id);
        CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_id);
        CREATE INDEX IF NOT EXISTS idx_edges_type ON edges(type);

        CREATE VIRTUAL TABLE IF NOT EXISTS nodes_fts USING fts5(
            id UNINDEXED,
            label,
            content,
            type,
            properties,
            content='nodes',
            content_rowid='rowid'
        );

        CREATE TRIGGER IF NOT EXISTS nodes_fts_insert AFTER INSERT ON nodes BEGIN
            INSERT INTO nodes_fts(rowid, id, label, content, type, properties)
            VALUES (new.rowid, new.id, new.label, coalesce(new.content, ''), new.type, new.properties);
        END;

        CREATE TRIGGER IF NOT EXISTS nodes_fts_delete AFTER DELETE ON nodes BEGIN
            INSERT INTO nodes_fts(nodes_fts, rowid, id, label, content, type, properties)
            VALUES ('delete', old.rowid, old.id, old.label, coalesce(old.content, ''), old.type, old.properties);
        END;

        CREATE TRIGGER IF NOT EXISTS nodes_fts_update AFTER UPDATE ON nodes BEGIN
            INSERT INTO nodes_fts(nodes_fts, rowid, id, label, content, type, properties)
            VALUES ('delete', old.rowid, old.id, old.label, coalesce(old.content, ''), old.type, old.properties);
            INSERT INTO nodes_fts(rowid, id, label, content, type, properties)
            VALUES (new.rowid, new.id, new.label, coalesce(new.content, ''), new.type, new.properties);
        END;
        "#,
    )
}
