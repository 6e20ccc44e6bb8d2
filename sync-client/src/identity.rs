//! Device identity bootstrap.

use crate::store::{ItemStore, StoreError, DEVICE_ID, DEVICE_NAME, PRIVATE_KEY, PUBLIC_KEY};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use sync_types::DeviceId;
use thiserror::Error;
use zeroize::Zeroizing;

/// Identity errors.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Key generation failed.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),
}

/// This device's identity.
#[derive(Clone)]
pub struct Identity {
    /// Device id registered with the relay.
    pub device_id: DeviceId,
    /// Display name.
    pub name: String,
    /// Public key, exchanged during pairing.
    pub public_key: String,
    /// Private key material.
    pub private_key: Zeroizing<String>,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("device_id", &self.device_id)
            .field("name", &self.name)
            .field("public_key", &self.public_key)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

/// Source of the local device identity.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Return the stored identity, creating it on first use.
    async fn get_or_create_identity(&self) -> Result<Identity, IdentityError>;

    /// Change the display name.
    async fn rename(&self, name: &str) -> Result<(), IdentityError>;
}

/// Identity kept in the item store's settings.
#[derive(Clone)]
pub struct SettingsIdentity {
    store: Arc<dyn ItemStore>,
}

impl SettingsIdentity {
    /// Create a provider over `store`.
    pub fn new(store: Arc<dyn ItemStore>) -> Self {
        Self { store }
    }

    async fn generate_keys(&self) -> Result<(String, Zeroizing<String>), IdentityError> {
        let mut secret = Zeroizing::new([0u8; 32]);
        getrandom::getrandom(&mut secret[..])
            .map_err(|e| IdentityError::KeyGeneration(e.to_string()))?;
        let public = STANDARD.encode(Sha256::digest(&secret[..]));
        let private = Zeroizing::new(STANDARD.encode(&secret[..]));
        self.store.set_setting(PUBLIC_KEY, &public).await?;
        self.store.set_setting(PRIVATE_KEY, &private).await?;
        Ok((public, private))
    }
}

#[async_trait]
impl IdentityProvider for SettingsIdentity {
    async fn get_or_create_identity(&self) -> Result<Identity, IdentityError> {
        let device_id = match self.store.get_setting(DEVICE_ID).await? {
            Some(id) if !id.is_empty() => DeviceId::new(id),
            _ => {
                let id = DeviceId::random();
                self.store.set_setting(DEVICE_ID, id.as_str()).await?;
                tracing::info!(device_id = %id, "Created device identity");
                id
            }
        };

        let name = match self.store.get_setting(DEVICE_NAME).await? {
            Some(name) if !name.is_empty() => name,
            _ => {
                let prefix: String = device_id.as_str().chars().take(6).collect();
                let name = format!("Device-{prefix}");
                self.store.set_setting(DEVICE_NAME, &name).await?;
                name
            }
        };

        let public = self.store.get_setting(PUBLIC_KEY).await?;
        let private = self.store.get_setting(PRIVATE_KEY).await?.map(Zeroizing::new);
        let (public_key, private_key) = match (public, private) {
            (Some(public), Some(private)) if !public.is_empty() && !private.is_empty() => {
                (public, private)
            }
            _ => self.generate_keys().await?,
        };

        Ok(Identity {
            device_id,
            name,
            public_key,
            private_key,
        })
    }

    async fn rename(&self, name: &str) -> Result<(), IdentityError> {
        self.store.set_setting(DEVICE_NAME, name).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn identity_is_created_once() {
        let store: Arc<dyn ItemStore> = Arc::new(MemoryStore::new());
        let provider = SettingsIdentity::new(store.clone());

        let first = provider.get_or_create_identity().await.unwrap();
        assert_eq!(first.device_id.as_str().len(), 36);
        assert!(first.name.starts_with("Device-"));
        assert_eq!(STANDARD.decode(first.private_key.as_bytes()).unwrap().len(), 32);

        let second = provider.get_or_create_identity().await.unwrap();
        assert_eq!(second.device_id, first.device_id);
        assert_eq!(second.public_key, first.public_key);
        assert_eq!(
            store.get_setting(DEVICE_ID).await.unwrap().as_deref(),
            Some(first.device_id.as_str())
        );
    }

    #[tokio::test]
    async fn rename_is_persisted() {
        let store: Arc<dyn ItemStore> = Arc::new(MemoryStore::new());
        let provider = SettingsIdentity::new(store);
        provider.get_or_create_identity().await.unwrap();
        provider.rename("Work laptop").await.unwrap();
        assert_eq!(
            provider.get_or_create_identity().await.unwrap().name,
            "Work laptop"
        );
    }

    #[test]
    fn debug_redacts_private_key() {
        let identity = Identity {
            device_id: DeviceId::new("a"),
            name: "Desk".into(),
            public_key: "pub".into(),
            private_key: Zeroizing::new("very-secret".into()),
        };
        let debug = format!("{identity:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("very-secret"));
    }
}
