//! On-disk queue of crash reports awaiting upload.
//!
//! A report is a `{basename}.dmp` minidump plus a `{basename}.kys` crash-key
//! file. New reports land in `Incoming`; each failed upload moves the pair
//! one generation down (`Retry`, then `Retry 2`), and a failure out of the
//! last generation hands the pair to the permanent-failure handler.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;

pub const INCOMING_DIR: &str = "Incoming";
pub const RETRY_DIR: &str = "Retry";
pub const RETRY2_DIR: &str = "Retry 2";

pub const MINIDUMP_EXTENSION: &str = "dmp";
pub const CRASH_KEYS_EXTENSION: &str = "kys";

/// Crash-key files without a minidump are swept after this long.
pub const ORPHAN_AGE: Duration = Duration::from_secs(24 * 60 * 60);

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Crash keys as stored in a `.kys` file: a JSON object of strings.
pub type CrashKeys = BTreeMap<String, String>;

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when told to.
#[derive(Clone, Debug)]
pub struct ManualClock(Arc<Mutex<SystemTime>>);

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        Self(Arc::new(Mutex::new(start)))
    }

    pub fn advance(&self, by: Duration) {
        *self.0.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.0.lock()
    }
}

/// Sends one report somewhere. Returns whether it was accepted.
pub trait Uploader {
    fn upload(&mut self, minidump: &Path, crash_keys: &CrashKeys) -> bool;
}

impl<F> Uploader for F
where
    F: FnMut(&Path, &CrashKeys) -> bool,
{
    fn upload(&mut self, minidump: &Path, crash_keys: &CrashKeys) -> bool {
        self(minidump, crash_keys)
    }
}

/// Called once for a report that failed every retry generation. The files
/// are deleted afterwards whatever the handler does.
pub trait PermanentFailureHandler {
    fn handle(&mut self, minidump: &Path, crash_keys: &Path) -> bool;
}

/// Keeps permanently failed reports as `{stem}.dmp`/`{stem}.kys` in `dir`.
#[derive(Clone, Debug)]
pub struct CopyToDirectory {
    dir: PathBuf,
}

impl CopyToDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl PermanentFailureHandler for CopyToDirectory {
    fn handle(&mut self, minidump: &Path, crash_keys: &Path) -> bool {
        let copy = |src: &Path| -> std::io::Result<()> {
            let name = src.file_name().ok_or(std::io::ErrorKind::InvalidInput)?;
            fs::copy(src, self.dir.join(name))?;
            Ok(())
        };
        let result = fs::create_dir_all(&self.dir).and_then(|()| copy(minidump)).and_then(|()| copy(crash_keys));
        match result {
            Ok(()) => true,
            Err(err) => {
                warn!(dir = %self.dir.display(), error = %err, "cannot keep failed report");
                false
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct RepositoryConfig {
    pub root: PathBuf,
    /// Minimum age of a report before it is retried from `Retry`/`Retry 2`.
    pub retry_interval: Duration,
}

impl RepositoryConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

/// Which generation a report was found in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Generation {
    Incoming,
    Retry,
    Retry2,
}

impl Generation {
    const ALL: [Generation; 3] = [Generation::Incoming, Generation::Retry, Generation::Retry2];

    fn dir_name(self) -> &'static str {
        match self {
            Self::Incoming => INCOMING_DIR,
            Self::Retry => RETRY_DIR,
            Self::Retry2 => RETRY2_DIR,
        }
    }

    fn next(self) -> Option<Self> {
        match self {
            Self::Incoming => Some(Self::Retry),
            Self::Retry => Some(Self::Retry2),
            Self::Retry2 => None,
        }
    }
}

pub struct ReportRepository {
    config: RepositoryConfig,
    clock: Box<dyn Clock>,
    uploader: Box<dyn Uploader + Send>,
    permanent_failure: Box<dyn PermanentFailureHandler + Send>,
}

impl ReportRepository {
    pub fn new(
        config: RepositoryConfig,
        clock: Box<dyn Clock>,
        uploader: Box<dyn Uploader + Send>,
        permanent_failure: Box<dyn PermanentFailureHandler + Send>,
    ) -> Self {
        Self {
            config,
            clock,
            uploader,
            permanent_failure,
        }
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    fn dir(&self, generation: Generation) -> PathBuf {
        self.config.root.join(generation.dir_name())
    }

    fn touch(&self, path: &Path) -> Result<()> {
        File::options().write(true).open(path)?.set_modified(self.clock.now())?;
        Ok(())
    }

    /// Admit a report. The minidump is moved into the repository; on
    /// failure nothing new is left behind.
    pub fn store_report(&self, minidump: &Path, crash_keys: &CrashKeys) -> Result<PathBuf> {
        let incoming = self.dir(Generation::Incoming);
        fs::create_dir_all(&incoming)?;

        let base = incoming.join(unique_basename(self.clock.now()));
        let keys_path = base.with_extension(CRASH_KEYS_EXTENSION);
        let dump_path = base.with_extension(MINIDUMP_EXTENSION);

        let admitted = (|| -> Result<()> {
            fs::write(&keys_path, serde_json::to_vec(crash_keys)?)?;
            move_file(minidump, &dump_path)?;
            self.touch(&keys_path)?;
            self.touch(&dump_path)?;
            Ok(())
        })();
        if let Err(err) = admitted {
            let _ = fs::remove_file(&keys_path);
            let _ = fs::remove_file(&dump_path);
            return Err(err);
        }

        info!(report = %dump_path.display(), "stored crash report");
        Ok(dump_path)
    }

    /// Try to upload one pending report. Returns `false` only when an
    /// upload was attempted and failed.
    pub fn upload_pending_report(&mut self) -> bool {
        self.sweep_orphans();

        let now = self.clock.now();
        for generation in Generation::ALL {
            for dump in self.minidumps(generation) {
                let keys = dump.with_extension(CRASH_KEYS_EXTENSION);
                if !keys.exists() {
                    debug!(report = %dump.display(), "deleting minidump without crash keys");
                    let _ = fs::remove_file(&dump);
                    continue;
                }
                if generation != Generation::Incoming && age(&dump, now) <= self.config.retry_interval {
                    continue;
                }
                return self.process(generation, &dump, &keys);
            }
        }
        true
    }

    fn process(&mut self, generation: Generation, dump: &Path, keys: &Path) -> bool {
        if let Err(err) = self.touch(dump).and_then(|()| self.touch(keys)) {
            warn!(report = %dump.display(), error = %err, "cannot touch report");
        }

        let uploaded = match read_crash_keys(keys) {
            Ok(crash_keys) => self.uploader.upload(dump, &crash_keys),
            Err(err) => {
                warn!(report = %dump.display(), error = %err, "unreadable crash keys");
                false
            }
        };
        if uploaded {
            info!(report = %dump.display(), "uploaded crash report");
            remove_pair(dump, keys);
            return true;
        }

        match generation.next() {
            Some(next) => {
                let dir = self.dir(next);
                let moved = fs::create_dir_all(&dir)
                    .and_then(|()| move_file(keys, &dir.join(file_name(keys))))
                    .and_then(|()| move_file(dump, &dir.join(file_name(dump))));
                match moved {
                    Ok(()) => info!(report = %dump.display(), generation = next.dir_name(), "upload failed, will retry"),
                    Err(err) => {
                        warn!(report = %dump.display(), error = %err, "cannot move report, dropping it");
                        remove_pair(dump, keys);
                    }
                }
            }
            None => {
                warn!(report = %dump.display(), "upload failed permanently");
                self.permanent_failure.handle(dump, keys);
                remove_pair(dump, keys);
            }
        }
        false
    }

    /// Delete crash-key files whose minidump never arrived.
    fn sweep_orphans(&self) {
        let now = self.clock.now();
        for generation in Generation::ALL {
            for keys in files_with_extension(&self.dir(generation), CRASH_KEYS_EXTENSION) {
                if !keys.with_extension(MINIDUMP_EXTENSION).exists() && age(&keys, now) > ORPHAN_AGE {
                    debug!(path = %keys.display(), "deleting orphaned crash keys");
                    let _ = fs::remove_file(&keys);
                }
            }
        }
    }

    fn minidumps(&self, generation: Generation) -> Vec<PathBuf> {
        files_with_extension(&self.dir(generation), MINIDUMP_EXTENSION)
    }

    /// Reports currently queued across all generations.
    pub fn report_count(&self) -> usize {
        Generation::ALL.iter().map(|&g| self.minidumps(g).len()).sum()
    }
}

/// Parse a `.kys` file. Non-string values are rejected.
pub fn read_crash_keys(path: &Path) -> Result<CrashKeys> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn unique_basename(now: SystemTime) -> String {
    static SEQUENCE: AtomicU64 = AtomicU64::new(0);
    let nanos = now.duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or_default();
    format!(
        "{nanos:x}-{:x}-{:x}",
        std::process::id(),
        SEQUENCE.fetch_add(1, Ordering::Relaxed)
    )
}

fn file_name(path: &Path) -> &std::ffi::OsStr {
    path.file_name().unwrap_or(path.as_os_str())
}

fn age(path: &Path, now: SystemTime) -> Duration {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| now.duration_since(modified).ok())
        .unwrap_or_default()
}

/// Rename, falling back to copy and delete across volumes.
fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}

fn remove_pair(dump: &Path, keys: &Path) {
    let _ = fs::remove_file(dump);
    let _ = fs::remove_file(keys);
}

fn files_with_extension(dir: &Path, extension: &str) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == extension))
        .collect();
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> CrashKeys {
        [("ptype".to_string(), "browser".to_string())].into_iter().collect()
    }

    fn repository(root: &Path, clock: &ManualClock, accept: bool) -> ReportRepository {
        ReportRepository::new(
            RepositoryConfig {
                root: root.to_path_buf(),
                retry_interval: Duration::from_secs(20),
            },
            Box::new(clock.clone()),
            Box::new(move |_: &Path, _: &CrashKeys| accept),
            Box::new(CopyToDirectory::new(root.join("failed"))),
        )
    }

    fn minidump(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"MDMP").unwrap();
        path
    }

    #[test]
    fn test_store_and_upload() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(SystemTime::now());
        let root = dir.path().join("reports");
        let repo = repository(&root, &clock, true);

        let a = repo.store_report(&minidump(dir.path(), "a.dmp"), &keys()).unwrap();
        let b = repo.store_report(&minidump(dir.path(), "b.dmp"), &keys()).unwrap();
        assert_ne!(a, b);
        assert_eq!(repo.report_count(), 2);
        assert!(!dir.path().join("a.dmp").exists());
        assert_eq!(read_crash_keys(&a.with_extension("kys")).unwrap(), keys());

        let mut repo = repo;
        assert!(repo.upload_pending_report());
        assert!(repo.upload_pending_report());
        assert_eq!(repo.report_count(), 0);
        assert!(repo.upload_pending_report());
    }

    #[test]
    fn test_failed_store_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(SystemTime::now());
        let repo = repository(dir.path(), &clock, true);
        assert!(repo.store_report(&dir.path().join("missing.dmp"), &keys()).is_err());
        assert!(files_with_extension(&dir.path().join(INCOMING_DIR), CRASH_KEYS_EXTENSION).is_empty());
    }

    #[test]
    fn test_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(SystemTime::now());
        let mut repo = repository(dir.path(), &clock, true);
        let incoming = dir.path().join(INCOMING_DIR);
        fs::create_dir_all(&incoming).unwrap();

        let lone_dump = minidump(&incoming, "x.dmp");
        let lone_keys = incoming.join("y.kys");
        fs::write(&lone_keys, b"{}").unwrap();
        repo.touch(&lone_keys).unwrap();

        assert!(repo.upload_pending_report());
        assert!(!lone_dump.exists());
        assert!(lone_keys.exists());

        clock.advance(ORPHAN_AGE + Duration::from_secs(1));
        assert!(repo.upload_pending_report());
        assert!(!lone_keys.exists());
    }

    #[test]
    fn test_crash_keys_must_be_strings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k.kys");
        fs::write(&path, br#"{"a": 1}"#).unwrap();
        assert!(matches!(read_crash_keys(&path), Err(crate::error::Error::CrashKeys(_))));
    }
}
