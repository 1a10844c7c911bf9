//! Field-level encryption collaborator boundary.
//!
//! The real cipher lives outside this core; here is only the seam it plugs
//! into, plus the field-walking helpers the connection store uses. Policy:
//! encryption failures are hard errors (never persist secrets in the clear
//! by accident), decryption failures are fail-open per field (keep the
//! stored value rather than corrupting the rest of the record).

use anyhow::{bail, Result};
use serde_json::Value;

/// Encrypts and decrypts individual JSON field values.
pub trait FieldCipher: Send + Sync {
    fn encrypt(&self, plaintext: &Value) -> Result<Value>;
    fn decrypt(&self, ciphertext: &Value) -> Result<Value>;

    /// Encrypt the named fields of `data` in place. Null and absent fields
    /// are skipped. Any failure aborts the whole operation.
    fn encrypt_fields(&self, data: &mut Value, fields: &[&str]) -> Result<()> {
        let Some(map) = data.as_object_mut() else {
            bail!("encrypt_fields expects a JSON object");
        };
        for field in fields {
            let Some(value) = map.get(*field) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let encrypted = self.encrypt(value)?;
            map.insert((*field).to_string(), encrypted);
        }
        Ok(())
    }

    /// Decrypt the named fields of `data` in place. A field that fails to
    /// decrypt keeps its stored value and is logged, so one bad field never
    /// loses the rest of the record.
    fn decrypt_fields(&self, data: &mut Value, fields: &[&str]) {
        let Some(map) = data.as_object_mut() else {
            return;
        };
        for field in fields {
            let Some(value) = map.get(*field) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            match self.decrypt(value) {
                Ok(decrypted) => {
                    map.insert((*field).to_string(), decrypted);
                }
                Err(err) => {
                    tracing::warn!(field, "failed to decrypt field, keeping stored value: {err}");
                }
            }
        }
    }
}

/// Pass-through cipher for development and tests.
pub struct NoopCipher;

impl FieldCipher for NoopCipher {
    fn encrypt(&self, plaintext: &Value) -> Result<Value> {
        Ok(plaintext.clone())
    }

    fn decrypt(&self, ciphertext: &Value) -> Result<Value> {
        Ok(ciphertext.clone())
    }
}
