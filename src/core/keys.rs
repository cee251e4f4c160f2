//! Purpose: Master-key persistence, per-column key derivation, and AEAD sealing.
//! Exports: `KeyManager`, `ColumnKey`, `Sealed`, `encrypt`, `decrypt`.
//! Role: Only component that touches key material; the codec calls it per encrypted field.
//! Invariants: A lost or unreadable key store with encrypted data present is fatal.
//! Invariants: Every seal uses a fresh random 96-bit nonce; column keys are never persisted.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use getrandom::fill as fill_random;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::core::dir::write_atomic;
use crate::core::error::{Error, ErrorKind};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

const DERIVATION_LABEL: &[u8] = b"vaultdb/column-key/v1";
const KEY_ID_LEN: usize = 16;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct ColumnKey([u8; KEY_LEN]);

impl ColumnKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for ColumnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ColumnKey(..)")
    }
}

/// AEAD output as stored on disk: `nonce ‖ ciphertext ‖ tag`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Sealed {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

impl Sealed {
    pub fn encoded_len(&self) -> usize {
        NONCE_LEN + self.ciphertext.len() + TAG_LEN
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.tag);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::new(ErrorKind::Corrupt).with_message("sealed value too short"));
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[..NONCE_LEN]);
        let tag_start = bytes.len() - TAG_LEN;
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&bytes[tag_start..]);
        Ok(Self {
            nonce,
            ciphertext: bytes[NONCE_LEN..tag_start].to_vec(),
            tag,
        })
    }
}

pub fn encrypt(key: &ColumnKey, plaintext: &[u8], aad: &[u8]) -> Result<Sealed, Error> {
    let mut nonce = [0u8; NONCE_LEN];
    fill_random(&mut nonce).map_err(|err| {
        Error::new(ErrorKind::Internal).with_message(format!("failed to generate nonce: {err}"))
    })?;
    let cipher = cipher_for(key)?;
    let mut sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|_| Error::new(ErrorKind::Internal).with_message("encryption failed"))?;
    let tag_start = sealed.len() - TAG_LEN;
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&sealed[tag_start..]);
    sealed.truncate(tag_start);
    Ok(Sealed {
        nonce,
        ciphertext: sealed,
        tag,
    })
}

pub fn decrypt(key: &ColumnKey, sealed: &Sealed, aad: &[u8]) -> Result<Vec<u8>, Error> {
    let cipher = cipher_for(key)?;
    let mut combined = Vec::with_capacity(sealed.ciphertext.len() + TAG_LEN);
    combined.extend_from_slice(&sealed.ciphertext);
    combined.extend_from_slice(&sealed.tag);
    cipher
        .decrypt(
            Nonce::from_slice(&sealed.nonce),
            Payload {
                msg: &combined,
                aad,
            },
        )
        .map_err(|_| {
            Error::new(ErrorKind::Integrity)
                .with_message("authentication failed for encrypted value")
                .with_hint("The value was tampered with or sealed under a different key.")
        })
}

fn cipher_for(key: &ColumnKey) -> Result<Aes256Gcm, Error> {
    <Aes256Gcm as KeyInit>::new_from_slice(&key.0)
        .map_err(|_| Error::new(ErrorKind::Internal).with_message("invalid column key length"))
}

#[derive(Debug, Serialize, Deserialize)]
struct KeyStoreFile {
    master_key_id: String,
    master_key_material: String,
    created_at: String,
}

pub struct KeyManager {
    path: PathBuf,
    key_id: String,
    created_at: String,
    master: [u8; KEY_LEN],
    cache: Mutex<HashMap<(String, String), ColumnKey>>,
}

impl fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyManager")
            .field("path", &self.path)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl KeyManager {
    /// Loads the master key, or creates one when no encrypted data depends on a
    /// previous key. The new key is durable before this returns.
    pub fn initialize(path: impl AsRef<Path>, encrypted_data_present: bool) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            return Self::load(path);
        }
        if encrypted_data_present {
            return Err(Error::new(ErrorKind::KeyUnavailable)
                .with_message("key store is missing but encrypted data exists")
                .with_path(&path)
                .with_hint("Restore the original key store; data sealed under a lost key is unrecoverable."));
        }
        Self::generate(path)
    }

    fn load(path: PathBuf) -> Result<Self, Error> {
        let unavailable = |message: &str| {
            Error::new(ErrorKind::KeyUnavailable)
                .with_message(message.to_string())
                .with_path(&path)
                .with_hint("Restore the original key store; data sealed under a lost key is unrecoverable.")
        };
        let text = std::fs::read_to_string(&path)
            .map_err(|err| unavailable("failed to read key store").with_source(err))?;
        let file: KeyStoreFile = serde_json::from_str(&text)
            .map_err(|err| unavailable("malformed key store").with_source(err))?;
        let material = hex_decode(&file.master_key_material)
            .ok_or_else(|| unavailable("key material is not valid hex"))?;
        let master: [u8; KEY_LEN] = material
            .as_slice()
            .try_into()
            .map_err(|_| unavailable("master key must be 256 bits"))?;
        if key_fingerprint(&master) != file.master_key_id {
            return Err(unavailable("master key id does not match key material"));
        }
        tracing::debug!(key_id = %file.master_key_id, "loaded master key");
        Ok(Self {
            path,
            key_id: file.master_key_id,
            created_at: file.created_at,
            master,
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn generate(path: PathBuf) -> Result<Self, Error> {
        let mut master = [0u8; KEY_LEN];
        fill_random(&mut master).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message(format!("failed to generate master key: {err}"))
        })?;
        let created_at = OffsetDateTime::now_utc().format(&Rfc3339).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to format key creation time")
                .with_source(err)
        })?;
        let file = KeyStoreFile {
            master_key_id: key_fingerprint(&master),
            master_key_material: hex_encode(&master),
            created_at,
        };
        let text = serde_json::to_string_pretty(&file).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode key store")
                .with_source(err)
        })?;
        write_atomic(&path, text.as_bytes(), true)?;
        tracing::info!(key_id = %file.master_key_id, path = %path.display(), "generated master key");
        Ok(Self {
            path,
            key_id: file.master_key_id,
            created_at: file.created_at,
            master,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn created_at(&self) -> &str {
        &self.created_at
    }

    /// HMAC-SHA256 of the master key over a domain-separated column identity.
    pub fn derive_column_key(&self, table: &str, column: &str) -> Result<ColumnKey, Error> {
        let cache_key = (table.to_string(), column.to_string());
        let mut cache = self.cache.lock();
        if let Some(key) = cache.get(&cache_key) {
            return Ok(key.clone());
        }
        let key = derive(&self.master, table, column)?;
        cache.insert(cache_key, key.clone());
        Ok(key)
    }

    pub fn seal(&self, table: &str, column: &str, plaintext: &[u8]) -> Result<Sealed, Error> {
        let key = self.derive_column_key(table, column)?;
        encrypt(&key, plaintext, column_aad(table, column).as_bytes())
    }

    pub fn open(&self, table: &str, column: &str, sealed: &Sealed) -> Result<Vec<u8>, Error> {
        let key = self.derive_column_key(table, column)?;
        decrypt(&key, sealed, column_aad(table, column).as_bytes()).map_err(|err| {
            let detail = format!("column '{column}': authentication failed");
            err.with_message(detail).with_table(table)
        })
    }

    #[cfg(test)]
    pub(crate) fn cached_keys(&self) -> usize {
        self.cache.lock().len()
    }
}

fn derive(master: &[u8; KEY_LEN], table: &str, column: &str) -> Result<ColumnKey, Error> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(master)
        .map_err(|_| Error::new(ErrorKind::Internal).with_message("invalid master key length"))?;
    mac.update(DERIVATION_LABEL);
    mac.update(&[0]);
    mac.update(table.as_bytes());
    mac.update(&[0]);
    mac.update(column.as_bytes());
    let digest = mac.finalize().into_bytes();
    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(&digest);
    Ok(ColumnKey(out))
}

fn column_aad(table: &str, column: &str) -> String {
    format!("{table}.{column}")
}

fn key_fingerprint(master: &[u8; KEY_LEN]) -> String {
    let digest = Sha256::digest(master);
    hex_encode(&digest[..KEY_ID_LEN / 2])
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(nibble_hex(byte >> 4));
        out.push(nibble_hex(byte & 0x0f));
    }
    out
}

fn nibble_hex(nibble: u8) -> char {
    match nibble {
        0..=9 => char::from(b'0' + nibble),
        _ => char::from(b'a' + (nibble - 10)),
    }
}

fn hex_decode(text: &str) -> Option<Vec<u8>> {
    let bytes = text.trim().as_bytes();
    if bytes.len() % 2 != 0 {
        return None;
    }
    bytes
        .chunks(2)
        .map(|pair| {
            let high = char::from(pair[0]).to_digit(16)?;
            let low = char::from(pair[1]).to_digit(16)?;
            u8::try_from(high * 16 + low).ok()
        })
        .collect()
}
