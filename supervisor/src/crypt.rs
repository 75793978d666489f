//! Encrypted credential store
//!
//! Envelope scheme over the `store`/`secrets` tables: each key id owns a
//! random 256-bit data key, wrapped under a KEK derived from the master
//! secret and a per-id random salt. Both the wrap and the stored values use
//! AES-256-GCM with fresh nonces, so a reader of the database file sees
//! only ciphertext indistinguishable from random. Salts, nonces and
//! ciphertexts are base64 strings at rest and byte vectors in memory.
//!
//! Without a master secret the store is inert: `put` is a no-op and `get`
//! returns nothing.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tracing::debug;

use crate::db::{Database, SecretsRow, StoreRow};

type HmacSha256 = Hmac<Sha256>;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const DATA_KEY_LEN: usize = 32;

/// Derive a 32-byte key-encryption key from the master secret and a salt
/// (HMAC-SHA256 extract then expand).
fn derive_kek(master: &[u8], salt: &[u8]) -> [u8; 32] {
    let mut extract =
        <HmacSha256 as Mac>::new_from_slice(salt).expect("hmac accepts any key length");
    extract.update(master);
    let prk = extract.finalize().into_bytes();

    let mut expand =
        <HmacSha256 as Mac>::new_from_slice(&prk).expect("hmac accepts any key length");
    expand.update(b"edgesec-kek");
    expand.update(&[0x01]);
    expand.finalize().into_bytes().into()
}

fn encrypt(key: &[u8; 32], nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| anyhow!("bad key length"))?;
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| anyhow!("encryption failure"))
}

fn decrypt(key: &[u8; 32], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| anyhow!("bad key length"))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| anyhow!("decryption failure"))
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

/// Per-process credential store context.
#[derive(Clone)]
pub struct CryptStore {
    db: Database,
    master: Option<Vec<u8>>,
}

impl CryptStore {
    pub fn new(db: Database, master: Option<Vec<u8>>) -> Self {
        Self { db, master }
    }

    pub fn has_master(&self) -> bool {
        self.master.is_some()
    }

    /// Store `plaintext` under `key`, encrypted with the data key named by
    /// `key_id` (created on first use). An empty plaintext clears the
    /// entry. Returns the at-rest ciphertext string (empty when nothing
    /// was stored) for callers mirroring it elsewhere.
    pub async fn put(&self, key: &str, key_id: &str, plaintext: &[u8]) -> Result<String> {
        let Some(master) = self.master.as_deref() else {
            debug!("No master secret, skipping credential write for {}", key);
            return Ok(String::new());
        };

        if plaintext.is_empty() {
            self.db
                .save_store_row(&StoreRow {
                    key: key.to_string(),
                    value: String::new(),
                    id: key_id.to_string(),
                    iv: String::new(),
                })
                .await?;
            return Ok(String::new());
        }

        let data_key = self.ensure_data_key(master, key_id).await?;

        let nonce = random_bytes(NONCE_LEN);
        let ciphertext = encrypt(&data_key, &nonce, plaintext)?;
        let value = BASE64.encode(ciphertext);

        self.db
            .save_store_row(&StoreRow {
                key: key.to_string(),
                value: value.clone(),
                id: key_id.to_string(),
                iv: BASE64.encode(nonce),
            })
            .await?;
        Ok(value)
    }

    /// Fetch and decrypt the value stored under `key`.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let Some(master) = self.master.as_deref() else {
            return Ok(None);
        };

        let Some(row) = self.db.get_store_row(key).await? else {
            return Ok(None);
        };
        if row.value.is_empty() {
            return Ok(None);
        }

        let Some(data_key) = self.load_data_key(master, &row.id).await? else {
            return Ok(None);
        };

        let nonce = BASE64.decode(&row.iv).context("bad store iv encoding")?;
        let ciphertext = BASE64.decode(&row.value).context("bad store value encoding")?;
        let plaintext = decrypt(&data_key, &nonce, &ciphertext)
            .with_context(|| format!("credential decrypt failed for {}", key))?;

        Ok(Some(plaintext))
    }

    /// Load the data key for `key_id`, creating and persisting one if the
    /// id is new.
    async fn ensure_data_key(&self, master: &[u8], key_id: &str) -> Result<[u8; 32]> {
        if let Some(key) = self.load_data_key(master, key_id).await? {
            return Ok(key);
        }

        let mut data_key = [0u8; DATA_KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut data_key);

        let salt = random_bytes(SALT_LEN);
        let kek = derive_kek(master, &salt);
        let nonce = random_bytes(NONCE_LEN);
        let wrapped = encrypt(&kek, &nonce, &data_key)?;

        self.db
            .save_secrets_row(&SecretsRow {
                id: key_id.to_string(),
                value: BASE64.encode(wrapped),
                salt: BASE64.encode(salt),
                iv: BASE64.encode(nonce),
            })
            .await?;

        Ok(data_key)
    }

    async fn load_data_key(&self, master: &[u8], key_id: &str) -> Result<Option<[u8; 32]>> {
        let Some(row) = self.db.get_secrets_row(key_id).await? else {
            return Ok(None);
        };

        let salt = BASE64.decode(&row.salt).context("bad secrets salt encoding")?;
        let nonce = BASE64.decode(&row.iv).context("bad secrets iv encoding")?;
        let wrapped = BASE64.decode(&row.value).context("bad secrets value encoding")?;

        let kek = derive_kek(master, &salt);
        let data_key = decrypt(&kek, &nonce, &wrapped)
            .with_context(|| format!("data key unwrap failed for id {}", key_id))?;

        data_key
            .as_slice()
            .try_into()
            .map(Some)
            .map_err(|_| anyhow!("unwrapped data key has wrong length"))
    }
}
