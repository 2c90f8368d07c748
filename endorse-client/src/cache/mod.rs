//! Encrypted key cache: persists the cipher key obtained from an AKA round
//! so that repeated provisioning calls within the validity window skip the
//! exchange entirely.
//!
//! Every error in this layer is recoverable by design: a missing, corrupt
//! or unreadable cache file only costs a cold AKA round. The orchestrator
//! logs cache failures and proceeds.

mod codec;

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use thiserror::Error;

use crate::client::AuthenticationResult;
use crate::config::KeyCacheConfig;

const ENV_KEY_STORE_KEY: &str = "ENDORSE_KEY_STORE_KEY";
const ENV_PROFILE_DIR: &str = "SORACOM_PROFILE_DIR";
const DEFAULT_UNSAFE_PASSWORD: &str = "!_S0r4C0m_&";
const CACHE_FILE_NAME: &str = ".endorse-client-key-cache";

/// A cached key expires one hour after it was stored.
const KEY_VALID_DURATION: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub(crate) enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("magic number does not match")]
    BadMagic,
    #[error("unsupported version number: {0}")]
    UnsupportedVersion(u32),
    #[error("unsupported tag: {0}")]
    UnsupportedTag(u32),
    #[error("signature does not match")]
    SignatureMismatch,
    #[error("encoded data block size is too short")]
    ShortCiphertext,
    #[error("malformed cache entry")]
    MalformedEntry,
    #[error("unable to determine the profile directory")]
    NoProfileDir,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct KeyCacheEntry {
    pub created: SystemTime,
    pub key: Vec<u8>,
}

impl KeyCacheEntry {
    fn is_expired(&self) -> bool {
        SystemTime::now() > self.created + KEY_VALID_DURATION
    }
}

pub(crate) trait KeyCache: Send {
    /// Returns the first valid cached result for the IMSI, evicting every
    /// expired or foreign entry touched along the way.
    fn find(&mut self, imsi: &str) -> Option<AuthenticationResult>;
    fn save(&mut self, imsi: &str, ar: &AuthenticationResult) -> Result<(), CacheError>;
}

pub(crate) fn new_key_cache(cfg: &KeyCacheConfig) -> Box<dyn KeyCache> {
    if cfg.clear {
        if let Err(e) = remove_cache_file(cfg) {
            debug!("unable to remove key cache file: {e}");
        }
    }

    if cfg.disabled {
        return Box::new(NoopKeyCache);
    }

    Box::new(FileKeyCache::open(cfg))
}

fn load_password() -> Vec<u8> {
    match env::var(ENV_KEY_STORE_KEY) {
        Ok(pw) if !pw.is_empty() => pw.into_bytes(),
        _ => DEFAULT_UNSAFE_PASSWORD.as_bytes().to_vec(),
    }
}

fn profile_dir(cfg: &KeyCacheConfig) -> Result<PathBuf, CacheError> {
    if let Some(dir) = &cfg.profile_dir {
        return Ok(dir.clone());
    }
    if let Ok(dir) = env::var(ENV_PROFILE_DIR) {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    dirs::home_dir()
        .map(|home| home.join(".soracom"))
        .ok_or(CacheError::NoProfileDir)
}

fn cache_path(cfg: &KeyCacheConfig) -> Result<PathBuf, CacheError> {
    Ok(profile_dir(cfg)?.join(CACHE_FILE_NAME))
}

fn remove_cache_file(cfg: &KeyCacheConfig) -> Result<(), CacheError> {
    let path = cache_path(cfg)?;
    fs::remove_file(path)?;
    Ok(())
}

/// Key cache used when caching is disabled.
struct NoopKeyCache;

impl KeyCache for NoopKeyCache {
    fn find(&mut self, _imsi: &str) -> Option<AuthenticationResult> {
        None
    }

    fn save(&mut self, _imsi: &str, _ar: &AuthenticationResult) -> Result<(), CacheError> {
        Ok(())
    }
}

/// File-backed key cache. The in-memory map is loaded eagerly and the whole
/// file is rewritten on every save.
struct FileKeyCache {
    path: Option<PathBuf>,
    entries: BTreeMap<String, KeyCacheEntry>,
}

impl FileKeyCache {
    fn open(cfg: &KeyCacheConfig) -> FileKeyCache {
        let path = match cache_path(cfg) {
            Ok(p) => Some(p),
            Err(e) => {
                warn!("key cache is not persisted: {e}");
                None
            }
        };

        let mut kc = FileKeyCache {
            path,
            entries: BTreeMap::new(),
        };

        let Some(path) = kc.path.clone() else {
            return kc;
        };

        if path.exists() {
            match load_file(&path) {
                Ok(entries) => kc.entries = entries,
                Err(e) => debug!("unable to load key cache from file: {e}"),
            }
        } else if let Err(e) = kc.write_file() {
            debug!("unable to create key cache file: {e}");
        }

        kc
    }

    fn write_file(&self) -> Result<(), CacheError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(dir) = path.parent() {
            create_profile_dir(dir)?;
        }

        let buf = codec::serialize(&self.entries, &load_password())?;
        write_private_file(path, &buf)?;
        Ok(())
    }
}

impl KeyCache for FileKeyCache {
    fn find(&mut self, imsi: &str) -> Option<AuthenticationResult> {
        let mut evicted = Vec::new();
        let mut hit = None;

        for (alias, entry) in &self.entries {
            if entry.is_expired() {
                evicted.push(alias.clone());
                continue;
            }
            if !alias.starts_with(imsi) {
                evicted.push(alias.clone());
                continue;
            }
            let Some(key_id) = alias.split('_').nth(1) else {
                evicted.push(alias.clone());
                continue;
            };

            hit = Some(AuthenticationResult {
                key_id: key_id.to_string(),
                imsi: imsi.to_string(),
                ck: entry.key.clone(),
            });
            break;
        }

        for alias in evicted {
            self.entries.remove(&alias);
        }

        hit
    }

    fn save(&mut self, imsi: &str, ar: &AuthenticationResult) -> Result<(), CacheError> {
        let alias = format!("{}_{}", imsi, ar.key_id);
        self.entries.insert(
            alias,
            KeyCacheEntry {
                created: SystemTime::now(),
                key: ar.ck.clone(),
            },
        );

        self.write_file()
    }
}

fn load_file(path: &Path) -> Result<BTreeMap<String, KeyCacheEntry>, CacheError> {
    let buf = fs::read(path)?;
    codec::parse(&buf, &load_password())
}

#[cfg(unix)]
fn create_profile_dir(dir: &Path) -> Result<(), CacheError> {
    use std::os::unix::fs::DirBuilderExt;

    let mut builder = fs::DirBuilder::new();
    builder.recursive(true).mode(0o700);
    builder.create(dir)?;
    Ok(())
}

#[cfg(not(unix))]
fn create_profile_dir(dir: &Path) -> Result<(), CacheError> {
    fs::create_dir_all(dir)?;
    Ok(())
}

#[cfg(unix)]
fn write_private_file(path: &Path, buf: &[u8]) -> Result<(), CacheError> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    f.write_all(buf)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private_file(path: &Path, buf: &[u8]) -> Result<(), CacheError> {
    fs::write(path, buf)?;
    Ok(())
}
