//! Encrypted template store.
//!
//! All enrollment records live in one blob:
//!
//! ```text
//! "FGS1" | nonce (12 bytes) | AES-256-GCM(postcard(StoreSnapshot))
//! ```
//!
//! The magic is bound as associated data. Every save draws a fresh random
//! nonce and replaces the file through a temp file + rename, so a crash
//! mid-write leaves the previous store intact.

use std::fs;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use log::{debug, info};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::error::{AuthError, AuthResult, EnrollError};
use crate::keys::EncryptionKey;
use crate::{EncodingExtractor, FaceRegion, FeatureVector};

const STORE_MAGIC: &[u8; 4] = b"FGS1";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentRecord {
    pub id: Uuid,
    pub name: String,
    pub encoding: FeatureVector,
}

impl EnrollmentRecord {
    pub fn new(name: impl Into<String>, encoding: FeatureVector) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            encoding,
        }
    }
}

/// Ordered set of enrollment records sharing one dimensionality.
///
/// The dimension is fixed by the first record and kept even if every record
/// is later removed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    dimension: Option<usize>,
    records: Vec<EnrollmentRecord>,
}

impl StoreSnapshot {
    pub fn from_records(records: Vec<EnrollmentRecord>) -> AuthResult<Self> {
        let snapshot = Self {
            dimension: records.first().map(|r| r.encoding.dimension()),
            records,
        };
        snapshot.validate()?;
        Ok(snapshot)
    }

    pub fn records(&self) -> &[EnrollmentRecord] {
        &self.records
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn check_dimension(&self, encoding: &FeatureVector) -> AuthResult<()> {
        match self.dimension {
            Some(expected) if expected != encoding.dimension() => {
                Err(AuthError::DimensionMismatch {
                    expected,
                    found: encoding.dimension(),
                })
            }
            _ => Ok(()),
        }
    }

    fn with_record(&self, record: EnrollmentRecord) -> AuthResult<Self> {
        check_name(&record)?;
        self.check_dimension(&record.encoding)?;
        let mut next = self.clone();
        next.dimension = Some(record.encoding.dimension());
        next.records.push(record);
        Ok(next)
    }

    fn without(&self, keep: impl Fn(&EnrollmentRecord) -> bool) -> (Self, Vec<EnrollmentRecord>) {
        let (kept, removed): (Vec<_>, Vec<_>) =
            self.records.iter().cloned().partition(|r| keep(r));
        (
            Self {
                dimension: self.dimension,
                records: kept,
            },
            removed,
        )
    }

    fn validate(&self) -> AuthResult<()> {
        self.records.iter().try_for_each(check_name)?;
        if let Some(expected) = self.dimension {
            for record in &self.records {
                if record.encoding.dimension() != expected {
                    return Err(AuthError::DimensionMismatch {
                        expected,
                        found: record.encoding.dimension(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn check_name(record: &EnrollmentRecord) -> AuthResult<()> {
    if record.name.trim().is_empty() {
        return Err(AuthError::EmptyName(record.id));
    }
    Ok(())
}

/// Read and decrypt the store at `path`.
///
/// A missing file is [`AuthError::NotFound`]; callers treat it as an empty
/// store. Anything that fails authentication is [`AuthError::Decryption`].
pub fn load(path: &Path, key: &EncryptionKey) -> AuthResult<StoreSnapshot> {
    let blob = match fs::read(path) {
        Ok(blob) => blob,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(AuthError::NotFound {
                path: path.to_path_buf(),
            })
        }
        Err(err) => return Err(AuthError::io(path, err)),
    };
    decrypt_snapshot(path, key, &blob)
}

/// Encrypt `snapshot` and atomically replace the store at `path`
pub fn save(path: &Path, key: &EncryptionKey, snapshot: &StoreSnapshot) -> AuthResult<()> {
    let blob = encrypt_snapshot(key, snapshot)?;

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|source| AuthError::io(parent, source))?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(|source| AuthError::io(path, source))?;
    {
        let file = tmp.as_file_mut();
        file.write_all(&blob)
            .and_then(|_| file.sync_all())
            .map_err(|source| AuthError::io(path, source))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))
                .map_err(|source| AuthError::io(path, source))?;
        }
    }

    tmp.persist(path)
        .map_err(|err| AuthError::io(path, err.error))?;
    sync_dir(parent);

    debug!(
        "wrote {} record(s) to {} ({} bytes)",
        snapshot.len(),
        path.display(),
        blob.len()
    );
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    // Makes the rename durable; the data itself is already synced
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

fn encrypt_snapshot(key: &EncryptionKey, snapshot: &StoreSnapshot) -> AuthResult<Vec<u8>> {
    let plaintext = zeroize::Zeroizing::new(postcard::to_allocvec(snapshot)?);
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| AuthError::Encryption("invalid AES-GCM key length".into()))?;

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext.as_slice(),
                aad: STORE_MAGIC,
            },
        )
        .map_err(|err| AuthError::Encryption(format!("failed to encrypt template store: {err}")))?;

    let mut blob = Vec::with_capacity(STORE_MAGIC.len() + NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(STORE_MAGIC);
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

fn decrypt_snapshot(path: &Path, key: &EncryptionKey, blob: &[u8]) -> AuthResult<StoreSnapshot> {
    let decryption = || AuthError::Decryption {
        path: path.to_path_buf(),
    };

    if blob.len() < STORE_MAGIC.len() + NONCE_LEN + TAG_LEN {
        return Err(decryption());
    }
    let (magic, rest) = blob.split_at(STORE_MAGIC.len());
    if magic != STORE_MAGIC {
        return Err(decryption());
    }
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| AuthError::Encryption("invalid AES-GCM key length".into()))?;
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: STORE_MAGIC,
            },
        )
        .map(zeroize::Zeroizing::new)
        .map_err(|_| decryption())?;

    let snapshot: StoreSnapshot = postcard::from_bytes(&plaintext)?;
    snapshot.validate()?;
    Ok(snapshot)
}

/// Handle over the on-disk store plus its in-memory snapshot.
///
/// Readers take an `Arc` of the current snapshot and never block writers for
/// longer than a pointer swap. Mutations are serialized, written to disk in
/// full, and only then published, so a reader sees either the old or the new
/// record set.
pub struct TemplateStore {
    path: PathBuf,
    key: EncryptionKey,
    current: RwLock<Arc<StoreSnapshot>>,
    writer: Mutex<()>,
}

impl TemplateStore {
    pub fn open(path: impl Into<PathBuf>, key: EncryptionKey) -> AuthResult<Self> {
        let path = path.into();
        let snapshot = match load(&path, &key) {
            Ok(snapshot) => {
                info!(
                    "Loaded {} enrolled face(s) from {}",
                    snapshot.len(),
                    path.display()
                );
                snapshot
            }
            Err(AuthError::NotFound { .. }) => {
                info!("No template store at {}; starting empty", path.display());
                StoreSnapshot::default()
            }
            Err(err) => return Err(err),
        };
        Ok(Self {
            path,
            key,
            current: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn append(&self, record: EnrollmentRecord) -> AuthResult<()> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let next = self.snapshot().with_record(record)?;
        self.commit(next)
    }

    /// Extract an encoding from `region` and append it under `name`
    pub fn enroll(
        &self,
        name: &str,
        region: &FaceRegion,
        extractor: &dyn EncodingExtractor,
    ) -> Result<EnrollmentRecord, EnrollError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EnrollError::EmptyName);
        }
        let encoding =
            panic::catch_unwind(AssertUnwindSafe(|| extractor.extract_encoding(region)))
                .map_err(|_| EnrollError::Extractor("extractor panicked".into()))??;
        let record = EnrollmentRecord::new(name, encoding);
        self.append(record.clone())?;
        info!("Enrolled face for {} ({})", record.name, record.id);
        Ok(record)
    }

    pub fn remove(&self, id: Uuid) -> AuthResult<EnrollmentRecord> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let (next, mut removed) = self.snapshot().without(|r| r.id != id);
        let record = removed.pop().ok_or(AuthError::RecordNotFound(id))?;
        self.commit(next)?;
        Ok(record)
    }

    /// Remove every record enrolled under `name`; returns what was removed
    pub fn remove_by_name(&self, name: &str) -> AuthResult<Vec<EnrollmentRecord>> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let (next, removed) = self.snapshot().without(|r| r.name != name);
        if !removed.is_empty() {
            self.commit(next)?;
        }
        Ok(removed)
    }

    /// Delete the store file and forget every record, dimension included
    pub fn purge(&self) -> AuthResult<()> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(AuthError::io(&self.path, err)),
        }
        *self.current.write().unwrap_or_else(PoisonError::into_inner) =
            Arc::new(StoreSnapshot::default());
        Ok(())
    }

    fn commit(&self, next: StoreSnapshot) -> AuthResult<()> {
        save(&self.path, &self.key, &next)?;
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        Ok(())
    }
}

impl std::fmt::Debug for TemplateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateStore")
            .field("path", &self.path)
            .field("records", &self.snapshot().len())
            .finish()
    }
}
