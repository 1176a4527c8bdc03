//! Optional per-field encryption.
//!
//! A sealed field is encrypted once with a random data key (AES-256-GCM); the
//! data key is then wrapped for every recipient key id. Any holder of one of
//! the recipient keys can open the field. Fields that are not sealed are
//! stored as plain bincode bytes.

use crate::error::{Error, Result};
use crate::hash::{Hash, Hasher};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use parking_lot::RwLock;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

/// Identifier of a shared encryption key.
pub type KeyId = Hash;

/// A 256-bit shared key.
#[derive(Clone)]
pub struct SymmetricKey {
    id: KeyId,
    secret: [u8; 32],
}

impl SymmetricKey {
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self::from_secret(secret)
    }

    pub fn from_secret(secret: [u8; 32]) -> Self {
        let id = Hasher::hash_parts(&[b"mdrl/key-id", &secret]);
        SymmetricKey { id, secret }
    }

    pub fn id(&self) -> KeyId {
        self.id
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.secret))
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymmetricKey({})", self.id.short())
    }
}

/// Source of decryption keys.
#[async_trait]
pub trait Keystore: Send + Sync {
    /// Key with the given id, if held locally.
    async fn get(&self, id: &KeyId) -> Option<SymmetricKey>;

    /// First locally held key among `candidates`.
    async fn get_any(&self, candidates: &[KeyId]) -> Option<SymmetricKey> {
        for candidate in candidates {
            if let Some(key) = self.get(candidate).await {
                return Some(key);
            }
        }
        None
    }
}

/// In-memory keystore.
#[derive(Default)]
pub struct MemoryKeystore {
    keys: RwLock<HashMap<KeyId, SymmetricKey>>,
}

impl MemoryKeystore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: SymmetricKey) -> KeyId {
        let id = key.id();
        self.keys.write().insert(id, key);
        id
    }

    /// Generates and stores a fresh key.
    pub fn generate(&self) -> KeyId {
        self.insert(SymmetricKey::generate())
    }
}

#[async_trait]
impl Keystore for MemoryKeystore {
    async fn get(&self, id: &KeyId) -> Option<SymmetricKey> {
        self.keys.read().get(id).cloned()
    }
}

/// Data key wrapped for one recipient.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    pub key_id: KeyId,
    pub nonce: [u8; 12],
    pub wrapped: Vec<u8>,
}

/// Ciphertext plus the wrapped data keys able to open it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBox {
    pub nonce: [u8; 12],
    pub ciphertext: Vec<u8>,
    pub keys: Vec<WrappedKey>,
}

fn random_nonce() -> [u8; 12] {
    let mut nonce = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

impl SealedBox {
    /// Encrypts `plaintext` for every recipient key. All recipients must be
    /// held by `keystore`.
    pub async fn seal(plaintext: &[u8], recipients: &[KeyId], keystore: &dyn Keystore) -> Result<Self> {
        if recipients.is_empty() {
            return Err(Error::InvalidArgument("sealing requires at least one recipient".into()));
        }
        let data_key = SymmetricKey::generate();
        let nonce = random_nonce();
        let ciphertext = data_key
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| Error::Crypto(e.to_string()))?;

        let mut keys = Vec::with_capacity(recipients.len());
        for key_id in recipients {
            let recipient = keystore
                .get(key_id)
                .await
                .ok_or_else(|| Error::InvalidArgument(format!("unknown recipient key {}", key_id.short())))?;
            let wrap_nonce = random_nonce();
            let wrapped = recipient
                .cipher()
                .encrypt(Nonce::from_slice(&wrap_nonce), data_key.secret.as_slice())
                .map_err(|e| Error::Crypto(e.to_string()))?;
            keys.push(WrappedKey {
                key_id: *key_id,
                nonce: wrap_nonce,
                wrapped,
            });
        }
        Ok(SealedBox { nonce, ciphertext, keys })
    }

    pub fn recipients(&self) -> Vec<KeyId> {
        self.keys.iter().map(|k| k.key_id).collect()
    }

    /// Opens the box with any locally held recipient key.
    pub async fn open(&self, keystore: &dyn Keystore) -> Result<Vec<u8>> {
        let key = keystore
            .get_any(&self.recipients())
            .await
            .ok_or(Error::AccessDenied)?;
        let wrapped = self
            .keys
            .iter()
            .find(|k| k.key_id == key.id())
            .ok_or(Error::AccessDenied)?;
        let secret = key
            .cipher()
            .decrypt(Nonce::from_slice(&wrapped.nonce), wrapped.wrapped.as_slice())
            .map_err(|e| Error::Crypto(e.to_string()))?;
        let secret: [u8; 32] = secret
            .try_into()
            .map_err(|_| Error::Crypto("wrapped key has wrong length".into()))?;
        SymmetricKey::from_secret(secret)
            .cipher()
            .decrypt(Nonce::from_slice(&self.nonce), self.ciphertext.as_slice())
            .map_err(|e| Error::Crypto(e.to_string()))
    }
}

/// Stored form of a field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    Plain(Vec<u8>),
    Sealed(SealedBox),
}

/// A field that is either plain or sealed, decoded once and cached.
#[derive(Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct MaybeEncrypted<T> {
    envelope: Envelope,
    #[serde(skip)]
    decoded: OnceLock<T>,
}

impl<T> MaybeEncrypted<T> {
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn is_sealed(&self) -> bool {
        matches!(self.envelope, Envelope::Sealed(_))
    }
}

impl<T> MaybeEncrypted<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn plain(value: T) -> Result<Self> {
        let bytes = bincode::serialize(&value).map_err(|e| Error::Encode(e.to_string()))?;
        Ok(Self::with_cached(Envelope::Plain(bytes), value))
    }

    pub async fn sealed(value: T, recipients: &[KeyId], keystore: &dyn Keystore) -> Result<Self> {
        let bytes = bincode::serialize(&value).map_err(|e| Error::Encode(e.to_string()))?;
        let sealed = SealedBox::seal(&bytes, recipients, keystore).await?;
        Ok(Self::with_cached(Envelope::Sealed(sealed), value))
    }

    fn with_cached(envelope: Envelope, value: T) -> Self {
        let decoded = OnceLock::new();
        let _ = decoded.set(value);
        MaybeEncrypted { envelope, decoded }
    }

    /// Decoded value, decoding plain bytes on first access. `None` while sealed.
    pub fn get(&self) -> Option<&T> {
        self.try_get().ok()
    }

    pub fn try_get(&self) -> Result<&T> {
        if let Some(value) = self.decoded.get() {
            return Ok(value);
        }
        match &self.envelope {
            Envelope::Plain(bytes) => {
                let value: T = bincode::deserialize(bytes)?;
                Ok(self.decoded.get_or_init(|| value))
            }
            Envelope::Sealed(_) => Err(Error::Sealed(std::any::type_name::<T>())),
        }
    }

    /// Decodes the field, opening it with `keystore` if sealed.
    pub async fn decrypt(&self, keystore: Option<&dyn Keystore>) -> Result<&T> {
        if let Some(value) = self.decoded.get() {
            return Ok(value);
        }
        match &self.envelope {
            Envelope::Plain(_) => self.try_get(),
            Envelope::Sealed(sealed) => {
                let keystore = keystore.ok_or(Error::AccessDenied)?;
                let bytes = sealed.open(keystore).await?;
                let value: T = bincode::deserialize(&bytes)?;
                Ok(self.decoded.get_or_init(|| value))
            }
        }
    }

    /// Canonical plaintext bytes of the decoded value.
    pub fn plaintext_bytes(&self) -> Result<Vec<u8>> {
        if let Envelope::Plain(bytes) = &self.envelope {
            return Ok(bytes.clone());
        }
        let value = self.try_get()?;
        bincode::serialize(value).map_err(|e| Error::Encode(e.to_string()))
    }
}

impl<T> fmt::Debug for MaybeEncrypted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.envelope {
            Envelope::Plain(bytes) => write!(f, "Plain({} bytes)", bytes.len()),
            Envelope::Sealed(sealed) => write!(f, "Sealed({} recipients)", sealed.keys.len()),
        }
    }
}

impl<T> PartialEq for MaybeEncrypted<T> {
    fn eq(&self, other: &Self) -> bool {
        self.envelope == other.envelope
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_seal_and_open() {
        let keystore = MemoryKeystore::new();
        let key = keystore.generate();
        let field = MaybeEncrypted::sealed("secret".to_string(), &[key], &keystore)
            .await
            .unwrap();
        assert!(field.is_sealed());

        let bytes = bincode::serialize(&field).unwrap();
        let received: MaybeEncrypted<String> = bincode::deserialize(&bytes).unwrap();
        assert!(received.get().is_none());
        assert_eq!(received.decrypt(Some(&keystore)).await.unwrap(), "secret");
        // cached afterwards
        assert_eq!(received.get().map(String::as_str), Some("secret"));
    }

    #[tokio::test]
    async fn test_open_without_key_is_access_denied() {
        let writer = MemoryKeystore::new();
        let key = writer.generate();
        let field = MaybeEncrypted::sealed(42u64, &[key], &writer).await.unwrap();
        let bytes = bincode::serialize(&field).unwrap();
        let received: MaybeEncrypted<u64> = bincode::deserialize(&bytes).unwrap();

        let stranger = MemoryKeystore::new();
        stranger.generate();
        assert_eq!(received.decrypt(Some(&stranger)).await, Err(Error::AccessDenied));
        assert_eq!(received.decrypt(None).await, Err(Error::AccessDenied));
    }

    #[tokio::test]
    async fn test_any_recipient_can_open() {
        let writer = MemoryKeystore::new();
        let first = SymmetricKey::from_secret([1; 32]);
        let second = SymmetricKey::from_secret([2; 32]);
        writer.insert(first.clone());
        writer.insert(second.clone());
        let field = MaybeEncrypted::sealed(vec![1u8, 2, 3], &[first.id(), second.id()], &writer)
            .await
            .unwrap();
        let bytes = bincode::serialize(&field).unwrap();

        let reader = MemoryKeystore::new();
        reader.insert(second);
        let received: MaybeEncrypted<Vec<u8>> = bincode::deserialize(&bytes).unwrap();
        assert_eq!(received.decrypt(Some(&reader)).await.unwrap(), &vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_seal_rejects_unknown_recipient() {
        let keystore = MemoryKeystore::new();
        let unknown = SymmetricKey::generate().id();
        let err = MaybeEncrypted::sealed(1u8, &[unknown], &keystore).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        let err = MaybeEncrypted::sealed(1u8, &[], &keystore).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_plain_field_decodes_lazily() {
        let field = MaybeEncrypted::plain(vec!["a".to_string()]).unwrap();
        let bytes = bincode::serialize(&field).unwrap();
        let received: MaybeEncrypted<Vec<String>> = bincode::deserialize(&bytes).unwrap();
        assert_eq!(received.get(), Some(&vec!["a".to_string()]));
        assert_eq!(received.plaintext_bytes().unwrap(), field.plaintext_bytes().unwrap());
    }
}
