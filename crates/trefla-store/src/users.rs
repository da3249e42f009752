//! Identity registry: users and their card claims.

use chrono::Utc;
use rusqlite::{params, params_from_iter};
use uuid::Uuid;

use trefla_shared::types::{CardStatus, UserId};

use crate::database::Database;
use crate::error::{not_found, Result};
use crate::models::User;
use crate::row;

const USER_COLUMNS: &str = "id, user_name, email, card_number, card_img_url, card_verified,
     noti_num, socket_id, device_token, created_at, updated_at";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Register a user with no card claim.
    pub fn create_user(&self, user_name: &str, email: &str) -> Result<User> {
        let now = Utc::now().to_rfc3339();
        self.conn().execute(
            "INSERT INTO users (user_name, email, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)",
            params![user_name, email, now],
        )?;
        self.get_user(UserId(self.conn().last_insert_rowid()))
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_user(&self, id: UserId) -> Result<User> {
        self.conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id.0],
                row_to_user,
            )
            .map_err(not_found)
    }

    /// Every user claiming `card_number`, ordered by id.
    ///
    /// An empty card number never matches anyone.
    pub fn users_by_card(&self, card_number: &str, verified_only: bool) -> Result<Vec<User>> {
        if card_number.is_empty() {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {USER_COLUMNS} FROM users
             WHERE card_number = ?1 AND (?2 = 0 OR card_verified = ?3) ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(
            params![card_number, verified_only, CardStatus::Verified.code()],
            row_to_user,
        )?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    /// The verified holder of `card_number`, if any.
    pub fn verified_holder(&self, card_number: &str) -> Result<Option<User>> {
        Ok(self.users_by_card(card_number, true)?.into_iter().next())
    }

    /// Users with the given ids; unknown ids are skipped.
    pub fn users_by_ids(&self, ids: &[UserId]) -> Result<Vec<User>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id IN ({placeholders}) ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params_from_iter(ids.iter().map(|id| id.0)), row_to_user)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Persist every mutable column of `user` and return the stored row.
    pub fn save_user(&self, user: &User) -> Result<User> {
        let affected = self.conn().execute(
            "UPDATE users SET user_name = ?1, email = ?2, card_number = ?3, card_img_url = ?4,
                 card_verified = ?5, noti_num = ?6, socket_id = ?7, device_token = ?8,
                 updated_at = ?9
             WHERE id = ?10",
            params![
                user.user_name,
                user.email,
                user.card_number,
                user.card_img_url,
                user.card_verified.code(),
                user.noti_num,
                user.socket_id.map(|s| s.to_string()),
                user.device_token,
                Utc::now().to_rfc3339(),
                user.id.0,
            ],
        )?;
        if affected == 0 {
            return Err(crate::StoreError::NotFound);
        }
        self.get_user(user.id)
    }

    /// Record a fresh card submission.  Any previous verification outcome is
    /// reset to pending.
    pub fn submit_card(&self, id: UserId, card_number: &str, card_img_url: &str) -> Result<User> {
        let mut user = self.get_user(id)?;
        user.card_number = card_number.trim().to_string();
        user.card_img_url = card_img_url.to_string();
        user.card_verified = CardStatus::Unverified;
        self.save_user(&user)
    }

    /// Bump the unread notification counter and return the new value.
    pub fn increment_noti_num(&self, id: UserId) -> Result<u32> {
        self.conn()
            .query_row(
                "UPDATE users SET noti_num = noti_num + 1 WHERE id = ?1 RETURNING noti_num",
                params![id.0],
                |row| row.get(0),
            )
            .map_err(not_found)
    }

    pub fn reset_noti_num(&self, id: UserId) -> Result<bool> {
        let affected = self
            .conn()
            .execute("UPDATE users SET noti_num = 0 WHERE id = ?1", params![id.0])?;
        Ok(affected > 0)
    }

    pub fn set_socket_id(&self, id: UserId, socket_id: Option<Uuid>) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE users SET socket_id = ?1 WHERE id = ?2",
            params![socket_id.map(|s| s.to_string()), id.0],
        )?;
        Ok(affected > 0)
    }

    /// Clear `socket_id` only if it still points at `socket_id`.
    pub fn clear_socket_id(&self, id: UserId, socket_id: Uuid) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE users SET socket_id = NULL WHERE id = ?1 AND socket_id = ?2",
            params![id.0, socket_id.to_string()],
        )?;
        Ok(affected > 0)
    }

    pub fn set_device_token(&self, id: UserId, device_token: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE users SET device_token = ?1 WHERE id = ?2",
            params![device_token, id.0],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let socket_id: Option<String> = row.get(7)?;
    let socket_id = socket_id
        .map(|s| Uuid::parse_str(&s))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(User {
        id: UserId(row.get(0)?),
        user_name: row.get(1)?,
        email: row.get(2)?,
        card_number: row.get(3)?,
        card_img_url: row.get(4)?,
        card_verified: row::code(row, 5, CardStatus::from_code)?,
        noti_num: row.get(6)?,
        socket_id,
        device_token: row.get(8)?,
        created_at: row::timestamp(row, 9)?,
        updated_at: row::timestamp(row, 10)?,
    })
}
