//! Durable connection state.
//!
//! The only state in this core that survives a restart: one `Connection`
//! record per user, stored through the key-value collaborator with its
//! secret-bearing fields passed through the field cipher. Webhook-driven
//! status updates land in the same record.

mod cipher;
mod kv;

pub use cipher::{FieldCipher, NoopCipher};
pub use kv::{JsonFileStore, KeyValueStore, MemoryStore};

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::aggregator::AccountSummary;

/// Storage path of the single connection record.
const CONNECTION_PATH: &str = "connections/primary";

/// Fields of the record that hold secrets or PII.
const ENCRYPTED_FIELDS: &[&str] = &["access_credential", "institution_name", "accounts"];

/// Lifecycle status of the linked item, as last reported by the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    NeedsReauth,
    PendingExpiration,
    PendingDisconnect,
}

/// Webhook-pushed status flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusFlags {
    pub needs_reauth: bool,
    pub has_new_accounts: bool,
    pub credentials_expiring: bool,
    pub is_disconnecting: bool,
}

/// Durable record of one linked bank connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    /// Long-lived access credential from the token exchange.
    pub access_credential: String,
    pub item_id: String,
    #[serde(default)]
    pub institution_name: Option<String>,
    #[serde(default)]
    pub accounts: Vec<AccountSummary>,
    pub status: ConnectionStatus,
    pub connected_at: DateTime<Utc>,
    #[serde(default)]
    pub has_new_accounts: bool,
    #[serde(default)]
    pub last_webhook_event: Option<String>,
}

impl Connection {
    /// Apply webhook flags, most severe status first.
    pub fn apply_flags(&mut self, flags: StatusFlags, event: Option<&str>) {
        self.status = if flags.is_disconnecting {
            ConnectionStatus::PendingDisconnect
        } else if flags.needs_reauth {
            ConnectionStatus::NeedsReauth
        } else if flags.credentials_expiring {
            ConnectionStatus::PendingExpiration
        } else {
            ConnectionStatus::Connected
        };
        self.has_new_accounts = flags.has_new_accounts;
        if let Some(event) = event {
            self.last_webhook_event = Some(event.to_string());
        }
    }
}

/// Persists the connection record, encrypting on the way in and decrypting
/// on the way out.
pub struct ConnectionStateStore {
    store: Arc<dyn KeyValueStore>,
    cipher: Arc<dyn FieldCipher>,
}

impl ConnectionStateStore {
    pub fn new(store: Arc<dyn KeyValueStore>, cipher: Arc<dyn FieldCipher>) -> Self {
        Self { store, cipher }
    }

    /// Encrypt secret fields and persist the record. Encryption failures are
    /// hard errors: a secret is never written in the clear.
    pub fn save(&self, connection: &Connection) -> Result<()> {
        let mut value =
            serde_json::to_value(connection).context("failed to serialize connection")?;
        self.cipher
            .encrypt_fields(&mut value, ENCRYPTED_FIELDS)
            .context("failed to encrypt connection fields")?;
        self.store.set(CONNECTION_PATH, value)?;
        tracing::info!(item_id = %connection.item_id, "connection saved");
        Ok(())
    }

    /// Load and decrypt the record, if one exists. A field that fails to
    /// decrypt keeps its stored value; the record as a whole only errors if
    /// it can no longer be deserialized at all.
    pub fn load(&self) -> Result<Option<Connection>> {
        let Some(mut value) = self.store.get(CONNECTION_PATH)? else {
            return Ok(None);
        };
        self.cipher.decrypt_fields(&mut value, ENCRYPTED_FIELDS);
        let connection =
            serde_json::from_value(value).context("stored connection record is corrupt")?;
        Ok(Some(connection))
    }

    /// Fold webhook flags into the stored record. No-op when nothing is
    /// linked (a webhook can race a disconnect).
    pub fn update_status_flags(&self, flags: StatusFlags, event: Option<&str>) -> Result<()> {
        let Some(mut connection) = self.load()? else {
            tracing::debug!("ignoring status flags with no stored connection");
            return Ok(());
        };
        connection.apply_flags(flags, event);
        self.save(&connection)
    }

    /// Remove the record. Used on disconnect; must always succeed locally.
    pub fn clear(&self) -> Result<()> {
        self.store.remove(CONNECTION_PATH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::Balances;

    fn sample_connection() -> Connection {
        Connection {
            access_credential: "access-token-1".to_string(),
            item_id: "item-1".to_string(),
            institution_name: Some("First Bank".to_string()),
            accounts: vec![AccountSummary {
                id: "acc-1".to_string(),
                name: "Checking".to_string(),
                mask: Some("0000".to_string()),
                account_type: "depository".to_string(),
                subtype: Some("checking".to_string()),
                balances: Balances {
                    available: Some(100.0),
                    current: Some(110.0),
                    limit: None,
                },
            }],
            status: ConnectionStatus::Connected,
            connected_at: Utc::now(),
            has_new_accounts: false,
            last_webhook_event: None,
        }
    }

    fn state_store() -> ConnectionStateStore {
        ConnectionStateStore::new(Arc::new(MemoryStore::new()), Arc::new(NoopCipher))
    }

    #[test]
    fn save_load_round_trip() {
        let store = state_store();
        let connection = sample_connection();
        store.save(&connection).unwrap();
        assert_eq!(store.load().unwrap().unwrap(), connection);
    }

    #[test]
    fn load_returns_none_when_unlinked() {
        assert!(state_store().load().unwrap().is_none());
    }

    #[test]
    fn status_flags_update_in_severity_order() {
        let store = state_store();
        store.save(&sample_connection()).unwrap();

        store
            .update_status_flags(
                StatusFlags {
                    credentials_expiring: true,
                    has_new_accounts: true,
                    ..Default::default()
                },
                Some("PENDING_EXPIRATION"),
            )
            .unwrap();
        let connection = store.load().unwrap().unwrap();
        assert_eq!(connection.status, ConnectionStatus::PendingExpiration);
        assert!(connection.has_new_accounts);
        assert_eq!(
            connection.last_webhook_event.as_deref(),
            Some("PENDING_EXPIRATION")
        );

        // Reauth outranks expiration, disconnect outranks both.
        store
            .update_status_flags(
                StatusFlags {
                    needs_reauth: true,
                    credentials_expiring: true,
                    is_disconnecting: true,
                    ..Default::default()
                },
                Some("USER_PERMISSION_REVOKED"),
            )
            .unwrap();
        let connection = store.load().unwrap().unwrap();
        assert_eq!(connection.status, ConnectionStatus::PendingDisconnect);
    }

    #[test]
    fn flags_without_connection_are_ignored() {
        let store = state_store();
        store
            .update_status_flags(
                StatusFlags {
                    needs_reauth: true,
                    ..Default::default()
                },
                None,
            )
            .unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn clear_removes_the_record() {
        let store = state_store();
        store.save(&sample_connection()).unwrap();
        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn secrets_are_not_stored_in_the_clear() {
        // A cipher that envelopes values, so the raw store can be inspected.
        struct Envelope;
        impl FieldCipher for Envelope {
            fn encrypt(&self, plaintext: &serde_json::Value) -> Result<serde_json::Value> {
                Ok(serde_json::json!({ "enc": plaintext.to_string() }))
            }
            fn decrypt(&self, ciphertext: &serde_json::Value) -> Result<serde_json::Value> {
                let inner = ciphertext
                    .get("enc")
                    .and_then(serde_json::Value::as_str)
                    .context("not an envelope")?;
                Ok(serde_json::from_str(inner)?)
            }
        }

        let kv = Arc::new(MemoryStore::new());
        let store = ConnectionStateStore::new(Arc::clone(&kv) as Arc<dyn KeyValueStore>, Arc::new(Envelope));
        let connection = sample_connection();
        store.save(&connection).unwrap();

        let raw = kv.get(CONNECTION_PATH).unwrap().unwrap();
        assert!(raw["access_credential"].get("enc").is_some());
        assert_ne!(raw["access_credential"], "access-token-1");
        // Non-secret fields stay readable.
        assert_eq!(raw["item_id"], "item-1");

        assert_eq!(store.load().unwrap().unwrap(), connection);
    }
}
