//! Per-user paths, resolved for the invoking user even under `sudo`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

pub const RUN_DIR_NAME: &str = ".kr";
pub const NOTIFY_DIR_NAME: &str = "notify";

pub const CONTROL_SOCKET: &str = "krd.sock";
pub const AGENT_SOCKET: &str = "krd-agent.sock";
pub const HOSTAUTH_SOCKET: &str = "krd-hostauth.sock";
pub const PID_FILE: &str = "krd.pid";
pub const LOG_FILE: &str = "krd.log";

/// Home directory of the user who invoked us.
///
/// Under `sudo`, `$HOME` may point at root's home; `SUDO_USER` names the
/// real user, whose home is looked up in the password database.
pub fn unsudoed_home_dir() -> Option<PathBuf> {
    if let Ok(user) = std::env::var("SUDO_USER") {
        if let Some(home) = passwd_home(&user) {
            return Some(home);
        }
    }
    directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf())
}

fn passwd_home(user: &str) -> Option<PathBuf> {
    let passwd = fs::read_to_string("/etc/passwd").ok()?;
    passwd_home_from(&passwd, user)
}

fn passwd_home_from(passwd: &str, user: &str) -> Option<PathBuf> {
    passwd.lines().find_map(|line| {
        let fields: Vec<&str> = line.split(':').collect();
        (fields.len() >= 7 && fields[0] == user && !fields[5].is_empty())
            .then(|| PathBuf::from(fields[5]))
    })
}

/// Host name advertised to the phone when pairing.
pub fn machine_name() -> String {
    fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| "workstation".to_string())
}

/// Resolved daemon directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KrDirs {
    pub run_dir: PathBuf,
    pub notify_dir: PathBuf,
    pub ssh_dir: PathBuf,
}

impl KrDirs {
    pub fn from_home(home: &Path) -> Self {
        let run_dir = home.join(RUN_DIR_NAME);
        Self {
            notify_dir: run_dir.join(NOTIFY_DIR_NAME),
            run_dir,
            ssh_dir: home.join(".ssh"),
        }
    }

    pub fn resolve() -> io::Result<Self> {
        let home = unsudoed_home_dir()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "home directory not found"))?;
        Ok(Self::from_home(&home))
    }

    pub fn control_socket(&self) -> PathBuf {
        self.run_dir.join(CONTROL_SOCKET)
    }

    pub fn agent_socket(&self) -> PathBuf {
        self.run_dir.join(AGENT_SOCKET)
    }

    pub fn hostauth_socket(&self) -> PathBuf {
        self.run_dir.join(HOSTAUTH_SOCKET)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.run_dir.join(PID_FILE)
    }

    /// Create the run and notify directories, owner-only.
    pub fn ensure(&self) -> io::Result<()> {
        for dir in [&self.run_dir, &self.notify_dir] {
            fs::create_dir_all(dir)?;
            #[cfg(unix)]
            fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
        }
        Ok(())
    }
}
