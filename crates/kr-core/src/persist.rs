//! Persistence of pairing, identity and known-host cache.
//!
//! Files under the run directory:
//! - `pairing.json`: serialized pairing, secret key included
//! - `me`: the cached identity profile
//! - `known_hosts`: line-oriented host-key pin cache
//!
//! plus `<ssh-dir>/id_kryptonite.pub` for SSH clients. Every write goes to a
//! uniquely named temporary file created with mode 0600 and is renamed over
//! the target.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::errors::PersistError;
use crate::pairing::{PairingSecret, PersistedPairing};
use crate::profile::Profile;

pub const PAIRING_FILE: &str = "pairing.json";
pub const ME_FILE: &str = "me";
pub const KNOWN_HOSTS_FILE: &str = "known_hosts";
pub const SSH_PUBKEY_FILE: &str = "id_kryptonite.pub";

pub trait Persister: Send + Sync {
    fn save_pairing(&self, ps: &PairingSecret) -> Result<(), PersistError>;
    fn load_pairing(&self) -> Result<Option<PairingSecret>, PersistError>;
    fn delete_pairing(&self) -> Result<(), PersistError>;

    fn save_me(&self, me: &Profile) -> Result<(), PersistError>;
    fn load_me(&self) -> Result<Option<Profile>, PersistError>;
    fn delete_me(&self) -> Result<(), PersistError>;

    /// Mirror the identity as an authorized-keys line for SSH clients.
    fn save_ssh_public_key(&self, me: &Profile) -> Result<(), PersistError>;
    fn delete_ssh_public_key(&self) -> Result<(), PersistError>;

    fn save_known_hosts(&self, contents: &str) -> Result<(), PersistError>;
    fn load_known_hosts(&self) -> Result<Option<String>, PersistError>;
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn temp_path(path: &Path) -> PathBuf {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!(".{}.{}.{}.tmp", name, std::process::id(), n))
}

/// Write `data` to `path` via a 0600 temporary file and rename.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    let tmp = temp_path(path);
    let result = write_new(&tmp, data).and_then(|()| fs::rename(&tmp, path));
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn write_new(tmp: &Path, data: &[u8]) -> io::Result<()> {
    {
        let mut opts = OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        opts.mode(0o600);
        let mut file = opts.open(tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    Ok(())
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, PersistError> {
    match fs::read(path) {
        Ok(b) => Ok(Some(b)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn remove_optional(path: &Path) -> Result<(), PersistError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn decode_pairing(bytes: &[u8]) -> Result<PairingSecret, PersistError> {
    let persisted: PersistedPairing = serde_json::from_slice(bytes)?;
    PairingSecret::try_from(persisted).map_err(|e| PersistError::Invalid(e.to_string()))
}

// ============================================================================
// File persister
// ============================================================================

#[derive(Debug, Clone)]
pub struct FilePersister {
    run_dir: PathBuf,
    ssh_dir: PathBuf,
}

impl FilePersister {
    pub fn new(run_dir: impl Into<PathBuf>, ssh_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
            ssh_dir: ssh_dir.into(),
        }
    }

    pub fn pairing_path(&self) -> PathBuf {
        self.run_dir.join(PAIRING_FILE)
    }

    pub fn me_path(&self) -> PathBuf {
        self.run_dir.join(ME_FILE)
    }

    pub fn known_hosts_path(&self) -> PathBuf {
        self.run_dir.join(KNOWN_HOSTS_FILE)
    }

    pub fn ssh_public_key_path(&self) -> PathBuf {
        self.ssh_dir.join(SSH_PUBKEY_FILE)
    }

    fn write_run_file(&self, path: &Path, data: &[u8]) -> Result<(), PersistError> {
        fs::create_dir_all(&self.run_dir)?;
        atomic_write(path, data)?;
        Ok(())
    }
}

impl Persister for FilePersister {
    fn save_pairing(&self, ps: &PairingSecret) -> Result<(), PersistError> {
        let json = serde_json::to_vec(&ps.to_persisted())?;
        self.write_run_file(&self.pairing_path(), &json)
    }

    fn load_pairing(&self) -> Result<Option<PairingSecret>, PersistError> {
        read_optional(&self.pairing_path())?
            .map(|b| decode_pairing(&b))
            .transpose()
    }

    fn delete_pairing(&self) -> Result<(), PersistError> {
        remove_optional(&self.pairing_path())
    }

    fn save_me(&self, me: &Profile) -> Result<(), PersistError> {
        let json = serde_json::to_vec(me)?;
        self.write_run_file(&self.me_path(), &json)
    }

    fn load_me(&self) -> Result<Option<Profile>, PersistError> {
        read_optional(&self.me_path())?
            .map(|b| serde_json::from_slice(&b).map_err(PersistError::from))
            .transpose()
    }

    fn delete_me(&self) -> Result<(), PersistError> {
        remove_optional(&self.me_path())
    }

    fn save_ssh_public_key(&self, me: &Profile) -> Result<(), PersistError> {
        let line = me
            .authorized_key_string()
            .map_err(|e| PersistError::Invalid(e.to_string()))?;
        fs::create_dir_all(&self.ssh_dir)?;
        atomic_write(&self.ssh_public_key_path(), format!("{}\n", line).as_bytes())?;
        Ok(())
    }

    fn delete_ssh_public_key(&self) -> Result<(), PersistError> {
        remove_optional(&self.ssh_public_key_path())
    }

    fn save_known_hosts(&self, contents: &str) -> Result<(), PersistError> {
        self.write_run_file(&self.known_hosts_path(), contents.as_bytes())
    }

    fn load_known_hosts(&self) -> Result<Option<String>, PersistError> {
        Ok(read_optional(&self.known_hosts_path())?
            .map(|b| String::from_utf8_lossy(&b).into_owned()))
    }
}

// ============================================================================
// In-memory persister
// ============================================================================

#[derive(Default)]
struct MemoryState {
    pairing: Option<Vec<u8>>,
    me: Option<Profile>,
    ssh_public_key: Option<String>,
    known_hosts: Option<String>,
}

/// Persister that keeps everything in memory.
#[derive(Default)]
pub struct MemoryPersister {
    state: Mutex<MemoryState>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_pairing(&self) -> bool {
        self.state.lock().pairing.is_some()
    }

    pub fn ssh_public_key(&self) -> Option<String> {
        self.state.lock().ssh_public_key.clone()
    }
}

impl Persister for MemoryPersister {
    fn save_pairing(&self, ps: &PairingSecret) -> Result<(), PersistError> {
        let json = serde_json::to_vec(&ps.to_persisted())?;
        self.state.lock().pairing = Some(json);
        Ok(())
    }

    fn load_pairing(&self) -> Result<Option<PairingSecret>, PersistError> {
        let bytes = self.state.lock().pairing.clone();
        bytes.map(|b| decode_pairing(&b)).transpose()
    }

    fn delete_pairing(&self) -> Result<(), PersistError> {
        self.state.lock().pairing = None;
        Ok(())
    }

    fn save_me(&self, me: &Profile) -> Result<(), PersistError> {
        self.state.lock().me = Some(me.clone());
        Ok(())
    }

    fn load_me(&self) -> Result<Option<Profile>, PersistError> {
        Ok(self.state.lock().me.clone())
    }

    fn delete_me(&self) -> Result<(), PersistError> {
        self.state.lock().me = None;
        Ok(())
    }

    fn save_ssh_public_key(&self, me: &Profile) -> Result<(), PersistError> {
        let line = me
            .authorized_key_string()
            .map_err(|e| PersistError::Invalid(e.to_string()))?;
        self.state.lock().ssh_public_key = Some(line);
        Ok(())
    }

    fn delete_ssh_public_key(&self) -> Result<(), PersistError> {
        self.state.lock().ssh_public_key = None;
        Ok(())
    }

    fn save_known_hosts(&self, contents: &str) -> Result<(), PersistError> {
        self.state.lock().known_hosts = Some(contents.to_string());
        Ok(())
    }

    fn load_known_hosts(&self) -> Result<Option<String>, PersistError> {
        Ok(self.state.lock().known_hosts.clone())
    }
}
