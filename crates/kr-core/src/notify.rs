//! Notification bus read by out-of-process consumers.
//!
//! The daemon appends human-readable lines to a file in the notify
//! directory; the PKCS#11 module and the CLI tail that file and print each
//! distinct line once. Writers never block on readers: a failed write is
//! logged and dropped.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tracing::{debug, warn};

const FILE_PREFIX: &str = "krd-notify";
const FILE_EXT: &str = "ntfy";
/// Past this size the file is truncated and readers rewind.
const MAX_FILE_BYTES: u64 = 256 * 1024;
/// Notification files untouched for this long are removed at startup.
pub const STALE_AFTER: Duration = Duration::from_secs(3600);

pub fn red(s: &str) -> String {
    format!("\x1b[91m{}\x1b[0m", s)
}

pub fn yellow(s: &str) -> String {
    format!("\x1b[93m{}\x1b[0m", s)
}

pub fn green(s: &str) -> String {
    format!("\x1b[92m{}\x1b[0m", s)
}

pub fn cyan(s: &str) -> String {
    format!("\x1b[96m{}\x1b[0m", s)
}

/// `<dir>/krd-notify[-<id>].ntfy`
pub fn notify_file_path(dir: &Path, id: &str) -> PathBuf {
    if id.is_empty() {
        dir.join(format!("{}.{}", FILE_PREFIX, FILE_EXT))
    } else {
        dir.join(format!("{}-{}.{}", FILE_PREFIX, id, FILE_EXT))
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    let mut opts = OpenOptions::new();
    opts.create(true).append(true);
    #[cfg(unix)]
    opts.mode(0o600);
    opts.open(path)
}

pub struct Notifier {
    path: Option<PathBuf>,
    file: Mutex<Option<File>>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier").field("path", &self.path).finish()
    }
}

impl Notifier {
    pub fn open(dir: &Path, id: &str) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = notify_file_path(dir, id);
        let file = open_append(&path)?;
        Ok(Self {
            path: Some(path),
            file: Mutex::new(Some(file)),
        })
    }

    /// A notifier that drops every line.
    pub fn disabled() -> Self {
        Self {
            path: None,
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append one line. Embedded newlines are flattened so that one call is
    /// one reader-visible line.
    pub fn notify(&self, message: &str) {
        let mut line = message.replace(['\r', '\n'], " ");
        line.push_str("\r\n");

        let mut guard = self.file.lock();
        let Some(file) = guard.as_mut() else {
            return;
        };
        if let Ok(meta) = file.metadata() {
            if meta.len() > MAX_FILE_BYTES {
                if let Err(e) = file.set_len(0) {
                    warn!(error = %e, "failed to rotate notification file");
                }
            }
        }
        if let Err(e) = file.write_all(line.as_bytes()) {
            warn!(error = %e, "failed to write notification");
        }
    }

    /// Start a fresh stream, e.g. after unpair.
    pub fn reinit(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let mut guard = self.file.lock();
        let reopened = fs::remove_file(path)
            .or_else(|e| if e.kind() == io::ErrorKind::NotFound { Ok(()) } else { Err(e) })
            .and_then(|_| open_append(path));
        match reopened {
            Ok(file) => *guard = Some(file),
            Err(e) => warn!(error = %e, "failed to reinit notifier"),
        }
    }
}

/// Remove notification files not modified within `max_age`.
pub fn cleanup_stale(dir: &Path, max_age: Duration) -> io::Result<usize> {
    let mut removed = 0;
    let now = SystemTime::now();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXT) {
            continue;
        }
        let modified = entry.metadata().and_then(|m| m.modified());
        if let Ok(modified) = modified {
            if now.duration_since(modified).unwrap_or_default() >= max_age {
                debug!(path = %path.display(), "removing stale notification file");
                if fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
        }
    }
    Ok(removed)
}

/// Tails a notification file, yielding each distinct line once.
pub struct NotificationReader {
    path: PathBuf,
    offset: u64,
    partial: Vec<u8>,
    seen: HashSet<String>,
}

impl NotificationReader {
    /// Start reading at the current end of the file.
    pub fn open(dir: &Path, id: &str) -> io::Result<Self> {
        let path = notify_file_path(dir, id);
        let offset = match fs::metadata(&path) {
            Ok(m) => m.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e),
        };
        Ok(Self {
            path,
            offset,
            partial: Vec::new(),
            seen: HashSet::new(),
        })
    }

    /// Lines appended since the last call, minus ones this reader has seen.
    pub fn read_new(&mut self) -> io::Result<Vec<String>> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.offset = 0;
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        let len = file.metadata()?.len();
        if len < self.offset {
            // truncated by the writer
            self.offset = 0;
            self.partial.clear();
        }
        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        self.offset += buf.len() as u64;
        self.partial.extend_from_slice(&buf);

        // decode complete lines only; a read may end mid-character
        let mut lines = Vec::new();
        while let Some(idx) = self.partial.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.partial.drain(..=idx).collect();
            let line = String::from_utf8_lossy(&raw)
                .trim_end_matches(['\r', '\n'])
                .to_string();
            if line.is_empty() {
                continue;
            }
            if self.seen.insert(line.clone()) {
                lines.push(line);
            }
        }
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_lines_are_seen_once_per_reader() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = Notifier::open(dir.path(), "").unwrap();
        let mut a = NotificationReader::open(dir.path(), "").unwrap();
        let mut b = NotificationReader::open(dir.path(), "").unwrap();

        for _ in 0..10 {
            notifier.notify("check your phone");
        }
        notifier.notify("approved");

        assert_eq!(a.read_new().unwrap(), vec!["check your phone", "approved"]);
        assert_eq!(b.read_new().unwrap(), vec!["check your phone", "approved"]);

        notifier.notify("check your phone");
        assert!(a.read_new().unwrap().is_empty());
    }

    #[test]
    fn reader_starts_at_end() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = Notifier::open(dir.path(), "cli").unwrap();
        notifier.notify("before");

        let mut r = NotificationReader::open(dir.path(), "cli").unwrap();
        notifier.notify("after");
        assert_eq!(r.read_new().unwrap(), vec!["after"]);
    }

    #[test]
    fn multi_line_message_is_one_line() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = Notifier::open(dir.path(), "").unwrap();
        let mut r = NotificationReader::open(dir.path(), "").unwrap();
        notifier.notify("a\nb");
        assert_eq!(r.read_new().unwrap(), vec!["a b"]);
    }

    #[test]
    fn character_split_across_reads_is_intact() {
        let dir = tempfile::tempdir().unwrap();
        let mut r = NotificationReader::open(dir.path(), "").unwrap();
        let path = notify_file_path(dir.path(), "");
        let line = "Kryptonite ▶ ok\n".as_bytes();
        let split = line.iter().position(|&b| b >= 0x80).unwrap() + 1;

        let mut f = OpenOptions::new().create(true).append(true).open(&path).unwrap();
        f.write_all(&line[..split]).unwrap();
        assert!(r.read_new().unwrap().is_empty());
        f.write_all(&line[split..]).unwrap();
        assert_eq!(r.read_new().unwrap(), vec!["Kryptonite ▶ ok"]);
    }

    #[test]
    fn reinit_restarts_stream() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = Notifier::open(dir.path(), "").unwrap();
        let mut r = NotificationReader::open(dir.path(), "").unwrap();
        notifier.notify("first stream line");
        assert_eq!(r.read_new().unwrap().len(), 1);

        notifier.reinit();
        notifier.notify("x");
        assert_eq!(r.read_new().unwrap(), vec!["x"]);
    }

    #[test]
    fn disabled_notifier_is_silent() {
        let n = Notifier::disabled();
        n.notify("nothing");
        assert!(n.path().is_none());
    }

    #[test]
    fn cleanup_keeps_fresh_files() {
        let dir = tempfile::tempdir().unwrap();
        let _n = Notifier::open(dir.path(), "fresh").unwrap();
        fs::write(dir.path().join("unrelated.txt"), b"x").unwrap();

        assert_eq!(cleanup_stale(dir.path(), STALE_AFTER).unwrap(), 0);
        assert_eq!(cleanup_stale(dir.path(), Duration::ZERO).unwrap(), 1);
        assert!(dir.path().join("unrelated.txt").exists());
    }
}
