use crate::error::{OutputError, Result};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, warn};
use uuid::Uuid;

/// Interval between attempts to take a held lock.
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default directory lock files are created in.
pub const DEFAULT_LOCK_DIR: &str = "/var/lock";

/// The physical thing a set of channels share. Every channel of an
/// output resolves to the same resource, so they all contend on one lock.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    /// A device on an I2C bus.
    I2c { bus: u8, address: u8 },
    /// A device reached over the network.
    Network { host: String, port: u16 },
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::I2c { bus, address } => write!(f, "i2c-{bus}@{address:#04x}"),
            Resource::Network { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

/// Identity of one lock, derived from a [`Resource`]. Cloning the token
/// does not create a new lock, all clones refer to the same file.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LockToken {
    path: PathBuf,
}

impl LockToken {
    /// File backing the lock.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Timeout bounded mutual exclusion over a physical resource. Lock files
/// are used so that separate processes driving the same bus also
/// serialise their transactions.
#[derive(Clone, Debug)]
pub struct HardwareLock {
    dir: PathBuf,
    poll_interval: Duration,
}

impl Default for HardwareLock {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_DIR)
    }
}

impl HardwareLock {
    /// Create a lock manager that keeps its files in `dir`.
    ///
    /// * `dir`: directory for the lock files, normally `/var/lock`.
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            poll_interval: LOCK_POLL_INTERVAL,
        }
    }

    /// Resolve the token for a resource. Two calls with equal resources
    /// always give equal tokens.
    pub fn token(&self, resource: &Resource) -> LockToken {
        let name = match resource {
            Resource::I2c { bus, address } => format!("aquaflux_i2c_{bus}_{address:#04x}"),
            Resource::Network { host, port } => {
                let host: String = host
                    .chars()
                    .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
                    .collect();
                format!("aquaflux_net_{host}_{port}")
            }
        };
        LockToken {
            path: self.dir.join(name),
        }
    }

    /// Take the lock, polling every 50 ms until `timeout` elapses.
    ///
    /// On timeout the (presumed stale) lock file is removed so the next
    /// caller can make progress, and this call still fails: the caller
    /// must treat the operation as not performed.
    pub fn acquire(&self, token: &LockToken, timeout: Duration) -> Result<LockGuard> {
        let nonce = Uuid::new_v4();
        let started = Instant::now();
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&token.path)
            {
                Ok(mut file) => {
                    // The nonce lets the guard tell its own file apart from
                    // one created after a forced break.
                    file.write_all(nonce.as_bytes())?;
                    return Ok(LockGuard {
                        token: token.clone(),
                        nonce,
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    let elapsed = started.elapsed();
                    if elapsed >= timeout {
                        warn!(lock = %token, "lock not released in {timeout:?}, breaking it");
                        if let Err(err) = fs::remove_file(&token.path) {
                            debug!(lock = %token, "could not break lock: {err}");
                        }
                        return Err(OutputError::LockTimeout(token.to_string()));
                    }
                    thread::sleep(self.poll_interval.min(timeout - elapsed));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Held lock. Dropping the guard releases it.
#[derive(Debug)]
pub struct LockGuard {
    token: LockToken,
    nonce: Uuid,
}

impl LockGuard {
    /// Token this guard holds.
    pub fn token(&self) -> &LockToken {
        &self.token
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Only remove the file if it is still ours, a forced break may have
        // handed the resource to somebody else in the meantime.
        match fs::read(&self.token.path) {
            Ok(contents) if contents == self.nonce.as_bytes() => {
                if let Err(err) = fs::remove_file(&self.token.path) {
                    warn!(lock = %self.token, "failed to release lock: {err}");
                }
            }
            Ok(_) => debug!(lock = %self.token, "lock was broken while held"),
            Err(err) => debug!(lock = %self.token, "lock file already gone: {err}"),
        }
    }
}

/// The lock of one output's resource together with its timeout. Drivers
/// call [`ResourceLock::hold`] around every single transaction.
#[derive(Clone, Debug)]
pub struct ResourceLock {
    lock: HardwareLock,
    token: LockToken,
    timeout: Duration,
}

impl ResourceLock {
    pub fn new(lock: &HardwareLock, resource: &Resource, timeout: Duration) -> Self {
        Self {
            token: lock.token(resource),
            lock: lock.clone(),
            timeout,
        }
    }

    pub fn hold(&self) -> Result<LockGuard> {
        self.lock.acquire(&self.token, self.timeout)
    }

    pub fn token(&self) -> &LockToken {
        &self.token
    }
}
