//! Per-card version counter.
//!
//! Every committed transition of a card's claim state (verify, reject,
//! unverify, transfer) advances the card's version.  A writer reads the
//! version before it starts and advances it with a compare-and-set inside its
//! transaction, so two writers racing on the same card cannot both commit.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use trefla_shared::types::UserId;

use crate::database::Database;
use crate::error::{Result, StoreError};

impl Database {
    /// Current version of `card_number`; 0 for a card never touched.
    pub fn card_version(&self, card_number: &str) -> Result<i64> {
        let version = self
            .conn()
            .query_row(
                "SELECT version FROM card_claims WHERE card_number = ?1",
                params![card_number],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version.unwrap_or(0))
    }

    /// Verified holder recorded by the last transition, if any.
    pub fn card_holder(&self, card_number: &str) -> Result<Option<UserId>> {
        let holder: Option<Option<i64>> = self
            .conn()
            .query_row(
                "SELECT holder_id FROM card_claims WHERE card_number = ?1",
                params![card_number],
                |row| row.get(0),
            )
            .optional()?;
        Ok(holder.flatten().map(UserId))
    }

    /// Compare-and-set: bump the version from `expected` to `expected + 1`.
    ///
    /// Fails with [`StoreError::VersionConflict`] when another writer got
    /// there first.
    pub fn advance_card_version(
        &self,
        card_number: &str,
        expected: i64,
        holder: Option<UserId>,
    ) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        self.conn().execute(
            "INSERT OR IGNORE INTO card_claims (card_number, version, holder_id, updated_at)
             VALUES (?1, 0, NULL, ?2)",
            params![card_number, now],
        )?;
        let affected = self.conn().execute(
            "UPDATE card_claims SET version = version + 1, holder_id = ?1, updated_at = ?2
             WHERE card_number = ?3 AND version = ?4",
            params![holder.map(|h| h.0), now, card_number, expected],
        )?;
        if affected == 0 {
            tracing::debug!(card_number, expected, "card version moved underneath writer");
            return Err(StoreError::VersionConflict {
                card_number: card_number.to_string(),
                expected,
            });
        }
        Ok(expected + 1)
    }
}
