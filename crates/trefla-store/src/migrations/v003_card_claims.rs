use rusqlite::Connection;

// One row per card number that ever went through a claim transition.
// `version` is bumped by every committed verify / reject / unverify / transfer.
const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS card_claims (
    card_number TEXT PRIMARY KEY NOT NULL,
    version     INTEGER NOT NULL DEFAULT 0,
    holder_id   INTEGER,                      -- verified holder after the last transition
    updated_at  TEXT NOT NULL
);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
