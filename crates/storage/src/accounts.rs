use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{Database, FromRow, Row, StorageError};

/// A locally known account.
#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub jid: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl FromRow for Account {
    fn from_row(row: &Row) -> Result<Self, StorageError> {
        Ok(Account {
            jid: row.text(0, "jid")?,
            display_name: row.opt_text(1),
            created_at: row.timestamp(2, "created_at")?,
        })
    }
}

pub struct AccountStore<D: Database> {
    db: Arc<D>,
}

impl<D: Database> AccountStore<D> {
    pub fn new(db: Arc<D>) -> Self {
        Self { db }
    }

    /// Record a successful login. The row is created once and never removed;
    /// later logins only refresh the display name.
    pub async fn record_login(
        &self,
        jid: &str,
        display_name: Option<&str>,
    ) -> Result<(), StorageError> {
        let jid = rookery_core::jid::bare_jid(jid);
        let display_name = display_name.map(str::to_string);
        let now = Utc::now();
        self.db
            .execute(
                "INSERT INTO accounts (jid, display_name, created_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(jid) DO UPDATE SET \
                 display_name = COALESCE(excluded.display_name, accounts.display_name)",
                &[&jid, &display_name, &now],
            )
            .await?;
        Ok(())
    }

    pub async fn accounts(&self) -> Result<Vec<Account>, StorageError> {
        self.db
            .query(
                "SELECT jid, display_name, created_at FROM accounts ORDER BY created_at, jid",
                &[],
            )
            .await
    }

    pub async fn account(&self, jid: &str) -> Result<Account, StorageError> {
        let jid = rookery_core::jid::bare_jid(jid);
        self.db
            .query_one(
                "SELECT jid, display_name, created_at FROM accounts WHERE jid = ?1",
                &[&jid],
            )
            .await
    }
}
