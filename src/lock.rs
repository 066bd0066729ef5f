//! Cross-process write lock for an index directory.
//!
//! Uses flock() for advisory locking on `<dir>/lock`.
//! - Rebuild sessions take the exclusive lock and hold it until commit/abort
//! - The holder keeps an owner record in the lock file and refreshes its
//!   heartbeat from a background thread
//! - A lock whose holder pid is gone and whose heartbeat is older than the
//!   grace period is reclaimed by replacing the lock file
//! - Queries never lock

use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use crate::eid::Eid;
use crate::error::{EngineError, Result};

/// Lock file name placed in the index directory
pub const LOCK_FILE_NAME: &str = "lock";

/// Delay between non-blocking lock attempts
const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Owner records are padded so a heartbeat rewrite never shrinks the file.
const OWNER_RECORD_WIDTH: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockOwner {
    pub pid: u32,
    pub session_id: String,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LockState {
    Free,
    Held { owner: Option<LockOwner>, stale: bool },
}

#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    pub timeout: Duration,
    pub stale_grace: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::ZERO,
            stale_grace: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(2),
        }
    }
}

pub struct WriteLock {
    path: PathBuf,
    options: LockOptions,
}

impl WriteLock {
    pub fn new(dir: &Path, options: LockOptions) -> Self {
        Self {
            path: dir.join(LOCK_FILE_NAME),
            options,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the exclusive write lock, retrying until the timeout elapses.
    ///
    /// Returns `IndexBusy` when another session holds the lock.
    pub fn acquire(&self) -> Result<LockToken> {
        let deadline = Instant::now() + self.options.timeout;
        // stale record seen on the previous attempt, reclaimed only if unchanged
        let mut suspect: Option<(String, DateTime<Utc>)> = None;

        loop {
            let file = open_lock_file(&self.path)?;

            match try_lock_exclusive(&file) {
                Ok(()) => {
                    // a reclaim may have replaced the file between open and flock
                    if !same_file(&file, &self.path)? {
                        log::debug!("lock file at {:?} was replaced, retrying", self.path);
                        continue;
                    }
                    return LockToken::start(file, self.path.clone(), self.options.heartbeat_interval);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    let owner = read_owner(&self.path);

                    if let Some(owner) = owner.as_ref() {
                        if is_stale(owner, self.options.stale_grace) {
                            let key = (owner.session_id.clone(), owner.heartbeat_at);
                            if suspect.as_ref() != Some(&key) {
                                // a new holder may not have written its record yet
                                suspect = Some(key);
                                std::thread::sleep(self.confirm_interval());
                                continue;
                            }
                            log::warn!(
                                "reclaiming stale lock held by pid {} (session {}, last heartbeat {})",
                                owner.pid,
                                owner.session_id,
                                owner.heartbeat_at
                            );
                            match std::fs::remove_file(&self.path) {
                                Ok(()) => continue,
                                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                                Err(err) => return Err(err.into()),
                            }
                        }
                    }

                    if Instant::now() >= deadline {
                        return Err(EngineError::IndexBusy(describe_holder(owner.as_ref())));
                    }
                    std::thread::sleep(RETRY_INTERVAL);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// How long a stale record must stay unchanged before it is reclaimed.
    fn confirm_interval(&self) -> Duration {
        self.options.heartbeat_interval.max(RETRY_INTERVAL)
    }

    /// Report who holds the lock without taking it.
    pub fn inspect(&self) -> LockState {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(_) => return LockState::Free,
        };

        match try_lock_exclusive(&file) {
            Ok(()) => {
                unlock(&file);
                LockState::Free
            }
            Err(_) => {
                let owner = read_owner(&self.path);
                let stale = owner
                    .as_ref()
                    .map(|o| is_stale(o, self.options.stale_grace))
                    .unwrap_or(false);
                LockState::Held { owner, stale }
            }
        }
    }
}

/// Exclusive ownership of the write path; released on drop.
pub struct LockToken {
    file: File,
    owner: LockOwner,
    path: PathBuf,
    heartbeat: Option<(mpsc::Sender<()>, JoinHandle<()>)>,
}

impl LockToken {
    fn start(file: File, path: PathBuf, interval: Duration) -> Result<Self> {
        let now = Utc::now();
        let owner = LockOwner {
            pid: std::process::id(),
            session_id: Eid::new().to_string(),
            acquired_at: now,
            heartbeat_at: now,
        };

        file.set_len(0)?;
        write_owner(&file, &owner)?;

        let heartbeat_file = file.try_clone()?;
        let mut heartbeat_owner = owner.clone();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = std::thread::Builder::new()
            .name("gendex-lock-heartbeat".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        heartbeat_owner.heartbeat_at = Utc::now();
                        if let Err(err) = write_owner(&heartbeat_file, &heartbeat_owner) {
                            log::warn!("failed to refresh lock heartbeat: {err}");
                        }
                    }
                    _ => break,
                }
            })?;

        log::debug!("acquired write lock {:?} (session {})", path, owner.session_id);

        Ok(Self {
            file,
            owner,
            path,
            heartbeat: Some((stop_tx, handle)),
        })
    }

    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    pub fn session_id(&self) -> &str {
        &self.owner.session_id
    }

    /// Release the lock now; dropping the token does the same.
    pub fn release(self) {}
}

impl Drop for LockToken {
    fn drop(&mut self) {
        if let Some((stop_tx, handle)) = self.heartbeat.take() {
            drop(stop_tx);
            let _ = handle.join();
        }
        // an empty record reads as a live holder, never as a stale one
        if let Err(err) = self.file.set_len(0) {
            log::warn!("failed to clear lock owner record: {err}");
        }
        unlock(&self.file);
        log::debug!("released write lock {:?} (session {})", self.path, self.owner.session_id);
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

fn read_owner(path: &Path) -> Option<LockOwner> {
    let mut contents = String::new();
    File::open(path).ok()?.read_to_string(&mut contents).ok()?;
    serde_json::from_str(contents.trim()).ok()
}

fn write_owner(file: &File, owner: &LockOwner) -> io::Result<()> {
    let json = serde_json::to_string(owner)?;
    let record = format!("{json:<width$}\n", width = OWNER_RECORD_WIDTH);
    write_at_start(file, record.as_bytes())?;
    file.sync_data()
}

#[cfg(unix)]
fn write_at_start(file: &File, bytes: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(bytes, 0)
}

#[cfg(not(unix))]
fn write_at_start(mut file: &File, bytes: &[u8]) -> io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    file.seek(SeekFrom::Start(0))?;
    file.write_all(bytes)
}

fn is_stale(owner: &LockOwner, grace: Duration) -> bool {
    let age = Utc::now()
        .signed_duration_since(owner.heartbeat_at)
        .to_std()
        .unwrap_or(Duration::ZERO);
    age > grace && !process_alive(owner.pid)
}

fn describe_holder(owner: Option<&LockOwner>) -> String {
    match owner {
        Some(owner) => format!(
            "rebuild in progress (pid {}, session {}, since {})",
            owner.pid, owner.session_id, owner.acquired_at
        ),
        None => "rebuild in progress".to_string(),
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    result == 0 || io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(unix)]
fn same_file(file: &File, path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match std::fs::metadata(path) {
        Ok(current) => Ok(held.dev() == current.dev() && held.ino() == current.ino()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(not(unix))]
fn same_file(_file: &File, _path: &Path) -> io::Result<bool> {
    Ok(true)
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> io::Result<()> {
    let fd = file.as_raw_fd();
    let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if result != 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock
            || err.raw_os_error() == Some(libc::EWOULDBLOCK)
            || err.raw_os_error() == Some(libc::EAGAIN)
        {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "index is locked by another rebuild",
            ));
        }
        return Err(err);
    }
    Ok(())
}

#[cfg(unix)]
fn unlock(file: &File) {
    let fd = file.as_raw_fd();
    // Release the lock - ignore errors
    unsafe { libc::flock(fd, libc::LOCK_UN) };
}

#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> io::Result<()> {
    // On non-Unix platforms, we don't implement locking (yet)
    Ok(())
}

#[cfg(not(unix))]
fn unlock(_file: &File) {}
