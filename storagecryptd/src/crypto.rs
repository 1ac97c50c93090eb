use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Mutex;

use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use keyring::Entry;
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use storagecrypt_core::{Phase, ProgressListener, checkpoint};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

pub const KEY_LEN: usize = 32;
pub const CHUNK_SIZE: usize = 64 * 1024;
pub const KEYRING_SERVICE: &str = "storagecrypt";

const STREAM_MAGIC: &[u8; 4] = b"SCRY";
const STREAM_VERSION: u8 = 1;
const NONCE_PREFIX_LEN: usize = 8;
const DIGEST_LEN: usize = 32;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = STREAM_MAGIC.len() + 1 + NONCE_PREFIX_LEN + DIGEST_LEN;
const FLAG_MORE: u8 = 0;
const FLAG_LAST: u8 = 1;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),
    #[error("no keys stored under alias {0}")]
    KeysNotFound(String),
    #[error("stored keys are malformed")]
    InvalidKeys,
    #[error("not an encrypted stream")]
    InvalidHeader,
    #[error("stream was modified or encrypted with other keys")]
    Tampered,
    #[error("stream is truncated")]
    Truncated,
    #[error("encryption error")]
    Encryption,
    #[error("canceled")]
    Canceled,
}

/// Encryption key plus the key that authenticates stream headers.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKeys {
    encryption: [u8; KEY_LEN],
    signature: [u8; KEY_LEN],
}

impl fmt::Debug for SecretKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKeys(..)")
    }
}

impl SecretKeys {
    pub fn new(encryption: [u8; KEY_LEN], signature: [u8; KEY_LEN]) -> Self {
        Self {
            encryption,
            signature,
        }
    }

    pub fn generate() -> Self {
        let mut encryption = [0u8; KEY_LEN];
        let mut signature = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut encryption);
        OsRng.fill_bytes(&mut signature);
        Self::new(encryption, signature)
    }

    pub fn to_hex(&self) -> String {
        let mut bytes = Vec::with_capacity(KEY_LEN * 2);
        bytes.extend_from_slice(&self.encryption);
        bytes.extend_from_slice(&self.signature);
        hex::encode(bytes)
    }

    pub fn from_hex(value: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(value.trim()).map_err(|_| CryptoError::InvalidKeys)?;
        if bytes.len() != KEY_LEN * 2 {
            return Err(CryptoError::InvalidKeys);
        }
        let mut encryption = [0u8; KEY_LEN];
        let mut signature = [0u8; KEY_LEN];
        encryption.copy_from_slice(&bytes[..KEY_LEN]);
        signature.copy_from_slice(&bytes[KEY_LEN..]);
        Ok(Self::new(encryption, signature))
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.encryption))
    }

    fn header_digest(&self, prefix: &[u8]) -> [u8; DIGEST_LEN] {
        let mut hasher = Sha256::new();
        hasher.update(self.signature);
        hasher.update(STREAM_MAGIC);
        hasher.update([STREAM_VERSION]);
        hasher.update(prefix);
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&hasher.finalize());
        digest
    }
}

/// Registry of key pairs by alias.
pub trait KeyStore: Send + Sync {
    fn get_keys(&self, alias: &str) -> Result<SecretKeys, CryptoError>;

    fn add_keys(&self, alias: &str, keys: &SecretKeys) -> Result<(), CryptoError>;

    fn contains(&self, alias: &str) -> Result<bool, CryptoError> {
        match self.get_keys(alias) {
            Ok(_) => Ok(true),
            Err(CryptoError::KeysNotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

/// Returns the keys of `alias`, generating and storing a pair on first use.
pub fn ensure_keys(store: &dyn KeyStore, alias: &str) -> Result<SecretKeys, CryptoError> {
    match store.get_keys(alias) {
        Ok(keys) => Ok(keys),
        Err(CryptoError::KeysNotFound(_)) => {
            let keys = SecretKeys::generate();
            store.add_keys(alias, &keys)?;
            tracing::info!(alias, "generated new key pair");
            Ok(keys)
        }
        Err(err) => Err(err),
    }
}

#[derive(Default)]
pub struct MemoryKeyStore {
    keys: Mutex<HashMap<String, SecretKeys>>,
}

impl KeyStore for MemoryKeyStore {
    fn get_keys(&self, alias: &str) -> Result<SecretKeys, CryptoError> {
        let keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        keys.get(alias)
            .cloned()
            .ok_or_else(|| CryptoError::KeysNotFound(alias.to_string()))
    }

    fn add_keys(&self, alias: &str, keys: &SecretKeys) -> Result<(), CryptoError> {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(alias.to_string(), keys.clone());
        Ok(())
    }
}

/// Keys kept in the desktop secret service, hex encoded.
pub struct KeyringKeyStore {
    service: String,
}

impl Default for KeyringKeyStore {
    fn default() -> Self {
        Self::new(KEYRING_SERVICE)
    }
}

impl KeyringKeyStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

impl KeyStore for KeyringKeyStore {
    fn get_keys(&self, alias: &str) -> Result<SecretKeys, CryptoError> {
        let entry = Entry::new(&self.service, alias)?;
        match entry.get_password() {
            Ok(value) => SecretKeys::from_hex(&value),
            Err(keyring::Error::NoEntry) => Err(CryptoError::KeysNotFound(alias.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    fn add_keys(&self, alias: &str, keys: &SecretKeys) -> Result<(), CryptoError> {
        let entry = Entry::new(&self.service, alias)?;
        entry.set_password(&keys.to_hex())?;
        Ok(())
    }
}

/// Encrypts `input` into the chunked stream format and returns the
/// number of plaintext bytes consumed.
pub async fn encrypt<R, W>(
    keys: &SecretKeys,
    input: R,
    output: W,
    listener: &dyn ProgressListener,
) -> Result<u64, CryptoError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut input = BufReader::new(input);
    let mut output = BufWriter::new(output);
    let cipher = keys.cipher();

    let mut prefix = [0u8; NONCE_PREFIX_LEN];
    OsRng.fill_bytes(&mut prefix);
    output.write_all(STREAM_MAGIC).await?;
    output.write_all(&[STREAM_VERSION]).await?;
    output.write_all(&prefix).await?;
    output.write_all(&keys.header_digest(&prefix)).await?;

    let mut current = read_chunk(&mut input).await?;
    let mut counter: u32 = 0;
    let mut total: u64 = 0;
    loop {
        if checkpoint(listener).await.is_err() {
            return Err(CryptoError::Canceled);
        }
        let next = if current.len() == CHUNK_SIZE {
            read_chunk(&mut input).await?
        } else {
            Vec::new()
        };
        let last = next.is_empty();
        let flag = if last { FLAG_LAST } else { FLAG_MORE };
        let sealed = cipher
            .encrypt(
                &chunk_nonce(&prefix, counter),
                Payload {
                    msg: &current,
                    aad: &[flag],
                },
            )
            .map_err(|_| CryptoError::Encryption)?;
        output.write_all(&[flag]).await?;
        output.write_all(&(sealed.len() as u32).to_be_bytes()).await?;
        output.write_all(&sealed).await?;

        total += current.len() as u64;
        listener.on_progress(Phase::Encrypt, total);
        if last {
            break;
        }
        counter = counter.checked_add(1).ok_or(CryptoError::Encryption)?;
        current = next;
    }
    output.flush().await?;
    Ok(total)
}

/// Verifies and decrypts a stream written by [`encrypt`]. Returns the
/// number of plaintext bytes written.
pub async fn decrypt<R, W>(
    keys: &SecretKeys,
    input: R,
    output: W,
    listener: &dyn ProgressListener,
) -> Result<u64, CryptoError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut input = BufReader::new(input);
    let mut output = BufWriter::new(output);
    let cipher = keys.cipher();

    let mut header = [0u8; HEADER_LEN];
    read_exact_or(&mut input, &mut header, CryptoError::InvalidHeader).await?;
    if &header[..STREAM_MAGIC.len()] != STREAM_MAGIC || header[STREAM_MAGIC.len()] != STREAM_VERSION
    {
        return Err(CryptoError::InvalidHeader);
    }
    let prefix_start = STREAM_MAGIC.len() + 1;
    let prefix = &header[prefix_start..prefix_start + NONCE_PREFIX_LEN];
    if header[prefix_start + NONCE_PREFIX_LEN..] != keys.header_digest(prefix) {
        return Err(CryptoError::Tampered);
    }

    let mut counter: u32 = 0;
    let mut total: u64 = 0;
    loop {
        if checkpoint(listener).await.is_err() {
            return Err(CryptoError::Canceled);
        }
        let mut record = [0u8; 5];
        read_exact_or(&mut input, &mut record, CryptoError::Truncated).await?;
        let flag = record[0];
        if flag != FLAG_MORE && flag != FLAG_LAST {
            return Err(CryptoError::Tampered);
        }
        let len = u32::from_be_bytes([record[1], record[2], record[3], record[4]]) as usize;
        if len < TAG_LEN || len > CHUNK_SIZE + TAG_LEN {
            return Err(CryptoError::Tampered);
        }
        let mut sealed = vec![0u8; len];
        read_exact_or(&mut input, &mut sealed, CryptoError::Truncated).await?;
        let plain = cipher
            .decrypt(
                &chunk_nonce(prefix, counter),
                Payload {
                    msg: &sealed,
                    aad: &[flag],
                },
            )
            .map_err(|_| CryptoError::Tampered)?;
        output.write_all(&plain).await?;
        total += plain.len() as u64;
        listener.on_progress(Phase::Decrypt, total);

        if flag == FLAG_LAST {
            let mut trailing = [0u8; 1];
            if input.read(&mut trailing).await? != 0 {
                return Err(CryptoError::Tampered);
            }
            break;
        }
        counter = counter.checked_add(1).ok_or(CryptoError::Tampered)?;
    }
    output.flush().await?;
    Ok(total)
}

pub async fn encrypt_file(
    keys: &SecretKeys,
    source: &Path,
    target: &Path,
    listener: &dyn ProgressListener,
) -> Result<u64, CryptoError> {
    let input = tokio::fs::File::open(source).await?;
    let output = tokio::fs::File::create(target).await?;
    if let Ok(meta) = input.metadata().await {
        listener.on_set_max(Phase::Encrypt, meta.len());
    }
    let result = encrypt(keys, input, output, listener).await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(target).await;
    }
    result
}

pub async fn decrypt_file(
    keys: &SecretKeys,
    source: &Path,
    target: &Path,
    listener: &dyn ProgressListener,
) -> Result<u64, CryptoError> {
    let input = tokio::fs::File::open(source).await?;
    let output = tokio::fs::File::create(target).await?;
    let result = decrypt(keys, input, output, listener).await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(target).await;
    }
    result
}

fn chunk_nonce(prefix: &[u8], counter: u32) -> Nonce {
    let mut nonce = [0u8; 12];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..].copy_from_slice(&counter.to_be_bytes());
    Nonce::clone_from_slice(&nonce)
}

async fn read_chunk<R: AsyncRead + Unpin>(input: &mut R) -> Result<Vec<u8>, CryptoError> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut filled = 0;
    while filled < CHUNK_SIZE {
        let read = input.read(&mut buf[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    buf.truncate(filled);
    Ok(buf)
}

async fn read_exact_or<R: AsyncRead + Unpin>(
    input: &mut R,
    buf: &mut [u8],
    on_eof: CryptoError,
) -> Result<(), CryptoError> {
    match input.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Err(on_eof),
        Err(err) => Err(err.into()),
    }
}
