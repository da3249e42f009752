use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS admins (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    user_name   TEXT NOT NULL,
    token       TEXT NOT NULL UNIQUE,         -- bearer token presented by the back-office
    role        TEXT NOT NULL,                -- SUPER / EMPLOYEE
    permissions TEXT NOT NULL DEFAULT '{}',   -- JSON PermissionSet
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS admin_notifications (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    type       TEXT NOT NULL,                 -- ID_TRANSFER, ...
    payload    TEXT NOT NULL,                 -- JSON
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_admin_notifications_type ON admin_notifications(type);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
