use chrono::Utc;
use rusqlite::params;

use trefla_shared::types::{NotificationId, NotificationType, UserId};

use crate::database::Database;
use crate::error::{not_found, Result};
use crate::models::{NewNotification, Notification};
use crate::row;

impl Database {
    /// Store a notification.  Does not touch the receiver's unread counter.
    pub fn create_notification(&self, new: &NewNotification) -> Result<Notification> {
        self.conn().execute(
            "INSERT INTO notifications (sender_id, receiver_id, type, optional_val, text, time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                new.sender_id.0,
                new.receiver_id.0,
                new.kind.code(),
                new.optional_val,
                new.text,
                Utc::now().to_rfc3339(),
            ],
        )?;
        self.get_notification(NotificationId(self.conn().last_insert_rowid()))
    }

    pub fn get_notification(&self, id: NotificationId) -> Result<Notification> {
        self.conn()
            .query_row(
                "SELECT id, sender_id, receiver_id, type, optional_val, text, time
                 FROM notifications WHERE id = ?1",
                params![id.0],
                row_to_notification,
            )
            .map_err(not_found)
    }

    /// Notifications addressed to `receiver`, newest first.
    pub fn notifications_for_user(&self, receiver: UserId, limit: u32) -> Result<Vec<Notification>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, sender_id, receiver_id, type, optional_val, text, time
             FROM notifications WHERE receiver_id = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![receiver.0, limit], row_to_notification)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }
}

fn row_to_notification(row: &rusqlite::Row<'_>) -> rusqlite::Result<Notification> {
    Ok(Notification {
        id: NotificationId(row.get(0)?),
        sender_id: UserId(row.get(1)?),
        receiver_id: UserId(row.get(2)?),
        kind: row::code(row, 3, NotificationType::from_code)?,
        optional_val: row.get(4)?,
        text: row.get(5)?,
        time: row::timestamp(row, 6)?,
    })
}
