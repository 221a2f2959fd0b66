//! Database schema for saved measurement sessions.

/// SQL schema for creating all session tables.
pub const SCHEMA: &str = r#"
-- Finished measurement sessions
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    athlete_id TEXT NOT NULL,
    user_email TEXT,
    recorded_at TEXT NOT NULL,
    sample_count INTEGER NOT NULL,
    samples_json TEXT NOT NULL,
    series_json TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_owner
    ON sessions(user_id, athlete_id, recorded_at DESC);
"#;

/// Schema version tracking table.
pub const SCHEMA_VERSION_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);
"#;

/// Current schema version
pub const CURRENT_VERSION: i32 = 1;
