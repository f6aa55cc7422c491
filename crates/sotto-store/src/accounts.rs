//! CRUD operations for the single [`Account`] record.

use chrono::{DateTime, Utc};
use rusqlite::params;

use sotto_shared::kdf::KdfParams;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Account;

impl Database {
    /// Insert the account record.  Fails with [`StoreError::AccountExists`]
    /// if one is already present; the store holds exactly one account.
    pub fn insert_account(&self, account: &Account) -> Result<()> {
        let existing: i64 =
            self.conn()
                .query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))?;
        if existing > 0 {
            return Err(StoreError::AccountExists);
        }

        self.conn().execute(
            "INSERT INTO accounts (id, username, kdf_salt, kdf_params, key_verifier,
                                   public_key, secret_key, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                account.id.to_string(),
                account.username,
                hex::encode(account.kdf_salt),
                serde_json::to_string(&account.kdf_params)?,
                account.key_verifier,
                hex::encode(account.public_key),
                hex::encode(account.secret_key),
                account.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Fetch the account record, if one exists.
    pub fn get_account(&self) -> Result<Option<Account>> {
        let result = self.conn().query_row(
            "SELECT id, username, kdf_salt, kdf_params, key_verifier,
                    public_key, secret_key, created_at
             FROM accounts LIMIT 1",
            [],
            row_to_account,
        );

        match result {
            Ok(account) => Ok(Some(account)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Sqlite(e)),
        }
    }

    /// Replace the stored key pair (key rotation).  Identifier and username
    /// are immutable and stay untouched.
    pub fn update_account_keys(&self, public_key: &[u8; 32], secret_key: &[u8; 32]) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE accounts SET public_key = ?1, secret_key = ?2",
            params![hex::encode(public_key), hex::encode(secret_key)],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

/// Map a `rusqlite::Row` to an [`Account`].
fn row_to_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    let id_str: String = row.get(0)?;
    let username: String = row.get(1)?;
    let salt_hex: String = row.get(2)?;
    let params_json: String = row.get(3)?;
    let key_verifier: String = row.get(4)?;
    let public_hex: String = row.get(5)?;
    let secret_hex: String = row.get(6)?;
    let created_str: String = row.get(7)?;

    let id = uuid::Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let kdf_salt = hex_to_array::<16>(&salt_hex, 2)?;

    let kdf_params: KdfParams = serde_json::from_str(&params_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let public_key = hex_to_array::<32>(&public_hex, 5)?;
    let secret_key = hex_to_array::<32>(&secret_hex, 6)?;

    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&created_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Account {
        id,
        username,
        kdf_salt,
        kdf_params,
        key_verifier,
        public_key,
        secret_key,
        created_at,
    })
}

/// Decode a hex column into a fixed-size array.
pub(crate) fn hex_to_array<const N: usize>(s: &str, column: usize) -> rusqlite::Result<[u8; N]> {
    let bytes = hex::decode(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let mut out = [0u8; N];
    if bytes.len() != N {
        return Err(rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Text,
            format!("expected {N} bytes, got {}", bytes.len()).into(),
        ));
    }
    out.copy_from_slice(&bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_account() -> Account {
        Account {
            id: uuid::Uuid::new_v4(),
            username: "alice".into(),
            kdf_salt: [9u8; 16],
            kdf_params: KdfParams::default_interactive(),
            key_verifier: "ab".repeat(32),
            public_key: [1u8; 32],
            secret_key: [2u8; 32],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn insert_and_get_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        let account = sample_account();

        db.insert_account(&account).unwrap();
        let loaded = db.get_account().unwrap().expect("account present");

        assert_eq!(loaded.id, account.id);
        assert_eq!(loaded.username, "alice");
        assert_eq!(loaded.kdf_salt, account.kdf_salt);
        assert_eq!(loaded.kdf_params, account.kdf_params);
        assert_eq!(loaded.public_key, account.public_key);
        assert_eq!(loaded.secret_key, account.secret_key);
    }

    #[test]
    fn second_insert_rejected() {
        let db = Database::open_in_memory().unwrap();
        db.insert_account(&sample_account()).unwrap();

        let err = db.insert_account(&sample_account()).unwrap_err();
        assert!(matches!(err, StoreError::AccountExists));
    }

    #[test]
    fn empty_store_has_no_account() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_account().unwrap().is_none());
    }

    #[test]
    fn key_rotation_replaces_pair_only() {
        let db = Database::open_in_memory().unwrap();
        let account = sample_account();
        db.insert_account(&account).unwrap();

        db.update_account_keys(&[7u8; 32], &[8u8; 32]).unwrap();

        let loaded = db.get_account().unwrap().unwrap();
        assert_eq!(loaded.public_key, [7u8; 32]);
        assert_eq!(loaded.secret_key, [8u8; 32]);
        assert_eq!(loaded.id, account.id);
        assert_eq!(loaded.username, account.username);
    }
}
