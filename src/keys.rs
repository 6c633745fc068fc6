use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use once_cell::sync::OnceCell;
use rand::{rngs::OsRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{AuthError, AuthResult};

/// AES-256-GCM key length
pub const KEY_LEN: usize = 32;

const RACE_RETRIES: usize = 20;
const RACE_RETRY_DELAY: Duration = Duration::from_millis(25);

/// Symmetric key protecting the template store. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Owns the key file and hands out the key it holds.
///
/// The file is read (or created) on the first call to
/// [`KeyManager::get_or_create_key`]; later calls return the cached key.
/// An existing file that cannot be read or has the wrong length is an
/// error, never a reason to mint a new key: that would orphan every store
/// encrypted with the old one.
#[derive(Debug)]
pub struct KeyManager {
    path: PathBuf,
    key: OnceCell<EncryptionKey>,
}

impl KeyManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            key: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_or_create_key(&self) -> AuthResult<&EncryptionKey> {
        self.key.get_or_try_init(|| load_or_generate(&self.path))
    }
}

fn load_or_generate(path: &Path) -> AuthResult<EncryptionKey> {
    match fs::read(path) {
        Ok(bytes) => key_from_file(path, Zeroizing::new(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => match create_key_file(path) {
            Ok(key) => Ok(key),
            // Lost a creation race with another process; use its key
            Err(AuthError::Io { source, .. }) if source.kind() == io::ErrorKind::AlreadyExists => {
                read_raced_key(path)
            }
            Err(err) => Err(err),
        },
        Err(err) => Err(AuthError::io(path, err)),
    }
}

/// Read a key file another process has just created.
///
/// The winner of the `create_new` race may still be writing, so a short
/// read is retried for a bounded time before it is reported as corrupt.
fn read_raced_key(path: &Path) -> AuthResult<EncryptionKey> {
    for _ in 0..RACE_RETRIES {
        let bytes = fs::read(path).map_err(|source| AuthError::io(path, source))?;
        let bytes = Zeroizing::new(bytes);
        if bytes.len() >= KEY_LEN {
            return key_from_file(path, bytes);
        }
        debug!("key file {} still being written; retrying", path.display());
        thread::sleep(RACE_RETRY_DELAY);
    }
    let bytes = fs::read(path).map_err(|source| AuthError::io(path, source))?;
    key_from_file(path, Zeroizing::new(bytes))
}

fn key_from_file(path: &Path, bytes: Zeroizing<Vec<u8>>) -> AuthResult<EncryptionKey> {
    let raw: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
        AuthError::io(
            path,
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "key file holds {} bytes, expected {KEY_LEN}",
                    bytes.len()
                ),
            ),
        )
    })?;
    check_ownership(path);
    Ok(EncryptionKey::from_bytes(raw))
}

fn create_key_file(path: &Path) -> AuthResult<EncryptionKey> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| AuthError::io(parent, source))?;
    }

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .map_err(|source| AuthError::io(path, source))?;

    let key = EncryptionKey::generate();
    let written = file
        .write_all(key.as_bytes())
        .and_then(|_| file.sync_all());
    if let Err(source) = written {
        // A truncated key file would make every later start fail
        let _ = fs::remove_file(path);
        return Err(AuthError::io(path, source));
    }

    info!("Generated new encryption key at {}", path.display());
    Ok(key)
}

#[cfg(unix)]
fn check_ownership(path: &Path) {
    use std::os::unix::fs::MetadataExt;

    let Ok(meta) = fs::metadata(path) else {
        return;
    };
    if meta.mode() & 0o077 != 0 {
        warn!(
            "key file {} is accessible to other users (mode {:o})",
            path.display(),
            meta.mode() & 0o777
        );
    }
    let euid = unsafe { libc::geteuid() };
    if meta.uid() != euid {
        warn!(
            "key file {} is owned by uid {}, not the current user ({})",
            path.display(),
            meta.uid(),
            euid
        );
    }
}

#[cfg(not(unix))]
fn check_ownership(_path: &Path) {}
