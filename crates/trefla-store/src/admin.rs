//! Back-office tables: admin accounts and the admin work queue.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use trefla_shared::permission::{AdminRole, PermissionSet};
use trefla_shared::types::{AdminNotificationId, AdminNotificationType, UserId};

use crate::database::Database;
use crate::error::{not_found, Result};
use crate::models::{Admin, AdminNotification};
use crate::row;

impl Database {
    // ------------------------------------------------------------------
    // Work items
    // ------------------------------------------------------------------

    pub fn create_admin_notification(
        &self,
        kind: AdminNotificationType,
        payload: &serde_json::Value,
    ) -> Result<AdminNotification> {
        self.conn().execute(
            "INSERT INTO admin_notifications (type, payload, created_at) VALUES (?1, ?2, ?3)",
            params![kind.as_str(), row::to_json(payload)?, Utc::now().to_rfc3339()],
        )?;
        self.get_admin_notification(AdminNotificationId(self.conn().last_insert_rowid()))
    }

    pub fn get_admin_notification(&self, id: AdminNotificationId) -> Result<AdminNotification> {
        self.conn()
            .query_row(
                "SELECT id, type, payload, created_at FROM admin_notifications WHERE id = ?1",
                params![id.0],
                row_to_admin_notification,
            )
            .map_err(not_found)
    }

    /// Pending work items of one kind, oldest first.
    pub fn list_admin_notifications(
        &self,
        kind: AdminNotificationType,
    ) -> Result<Vec<AdminNotification>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, type, payload, created_at FROM admin_notifications
             WHERE type = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![kind.as_str()], row_to_admin_notification)?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    pub fn delete_admin_notification(&self, id: AdminNotificationId) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM admin_notifications WHERE id = ?1", params![id.0])?;
        Ok(affected > 0)
    }

    /// Remove every `ID_TRANSFER` item for the `from -> to` pair.
    pub fn delete_transfer_request(&self, from: UserId, to: UserId) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM admin_notifications
             WHERE type = ?1
               AND json_extract(payload, '$.from') = ?2
               AND json_extract(payload, '$.to') = ?3",
            params![AdminNotificationType::IdTransfer.as_str(), from.0, to.0],
        )?;
        Ok(affected)
    }

    // ------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------

    pub fn create_admin(
        &self,
        user_name: &str,
        token: &str,
        role: AdminRole,
        permissions: &PermissionSet,
    ) -> Result<Admin> {
        self.conn().execute(
            "INSERT INTO admins (user_name, token, role, permissions, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user_name,
                token,
                role.as_str(),
                row::to_json(permissions)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        let id = self.conn().last_insert_rowid();
        self.conn()
            .query_row(
                "SELECT id, user_name, role, permissions, created_at FROM admins WHERE id = ?1",
                params![id],
                row_to_admin,
            )
            .map_err(not_found)
    }

    /// Resolve a back-office bearer token.
    pub fn get_admin_by_token(&self, token: &str) -> Result<Option<Admin>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, user_name, role, permissions, created_at FROM admins WHERE token = ?1",
                params![token],
                row_to_admin,
            )
            .optional()?)
    }
}

fn text_failure(idx: usize, e: trefla_shared::TypeError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn row_to_admin_notification(row: &rusqlite::Row<'_>) -> rusqlite::Result<AdminNotification> {
    let kind: String = row.get(1)?;
    Ok(AdminNotification {
        id: AdminNotificationId(row.get(0)?),
        kind: AdminNotificationType::parse(&kind).map_err(|e| text_failure(1, e))?,
        payload: row::json(row, 2)?,
        created_at: row::timestamp(row, 3)?,
    })
}

fn row_to_admin(row: &rusqlite::Row<'_>) -> rusqlite::Result<Admin> {
    let role: String = row.get(2)?;
    Ok(Admin {
        id: row.get(0)?,
        user_name: row.get(1)?,
        role: AdminRole::parse(&role).map_err(|e| text_failure(2, e))?,
        permissions: row::json(row, 3)?,
        created_at: row::timestamp(row, 4)?,
    })
}
