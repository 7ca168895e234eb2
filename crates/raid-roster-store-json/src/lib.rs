use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use raid_roster_core::{Recruitment, RecruitmentId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use ulid::Ulid;

pub const SNAPSHOT_FILE_NAME: &str = "recruitment_data.json";

/// Keyed in-memory collection of recruitments. Callers serialize access.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecruitmentStore {
    records: BTreeMap<RecruitmentId, Recruitment>,
}

impl RecruitmentStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, id: &RecruitmentId) -> Option<&Recruitment> {
        self.records.get(id)
    }

    /// Insert or replace a record, returning the previous value.
    pub fn put(&mut self, record: Recruitment) -> Option<Recruitment> {
        self.records.insert(record.id, record)
    }

    pub fn delete(&mut self, id: &RecruitmentId) -> Option<Recruitment> {
        self.records.remove(id)
    }

    pub fn all_entries(&self) -> impl Iterator<Item = (&RecruitmentId, &Recruitment)> {
        self.records.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Encode as one JSON object keyed by recruitment id.
    ///
    /// # Errors
    /// Returns an error when a record cannot be serialized.
    pub fn to_document(&self) -> Result<Value> {
        let mut document = Map::new();
        for (id, record) in &self.records {
            let value = serde_json::to_value(record)
                .with_context(|| format!("failed to serialize recruitment {id}"))?;
            document.insert(id.to_string(), value);
        }
        Ok(Value::Object(document))
    }

    /// Decode a snapshot document, skipping records that fail to parse or validate.
    ///
    /// # Errors
    /// Returns an error when the document is not a JSON object.
    pub fn from_document(document: Value) -> Result<(Self, Vec<SkippedRecord>)> {
        let Value::Object(entries) = document else {
            return Err(anyhow!("snapshot document MUST be a JSON object keyed by recruitment id"));
        };

        let mut store = Self::new();
        let mut skipped = Vec::new();
        for (key, value) in entries {
            match decode_record(&key, value) {
                Ok(record) => {
                    store.put(record);
                }
                Err(err) => skipped.push(SkippedRecord { key, reason: format!("{err:#}") }),
            }
        }
        Ok((store, skipped))
    }
}

fn decode_record(key: &str, value: Value) -> Result<Recruitment> {
    let record = serde_json::from_value::<Recruitment>(value)
        .context("record does not match the recruitment schema")?;
    if record.id.to_string() != key {
        return Err(anyhow!("record id {} does not match its key", record.id));
    }
    record.validate().map_err(|err| anyhow!("record failed validation: {err}"))?;
    Ok(record)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkippedRecord {
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoadSource {
    Primary,
    Backup,
    /// Neither file existed, or the primary was empty.
    Empty,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoadReport {
    pub source: LoadSource,
    pub loaded: usize,
    pub skipped: Vec<SkippedRecord>,
    /// Why the primary file was passed over for the backup.
    pub primary_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotReport {
    pub path: String,
    pub records: usize,
    pub bytes: usize,
    pub sha256: String,
    pub backed_up: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotInspection {
    pub path: String,
    pub exists: bool,
    pub sha256: Option<String>,
    pub backup_exists: bool,
    pub report: LoadReport,
}

/// Whole-store JSON snapshot with a sibling backup of the previous write.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(SNAPSHOT_FILE_NAME))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn backup_path(&self) -> PathBuf {
        sibling(&self.path, "bak")
    }

    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        sibling(&self.path, "lock")
    }

    /// A fresh staging name per write, so concurrent writers never share one.
    fn staging_path(&self, role: &str) -> PathBuf {
        sibling(&self.path, &format!("{role}.{}.tmp", Ulid::new()))
    }

    fn ensure_parent(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create snapshot directory {}", parent.display())
            })?;
        }
        Ok(())
    }

    /// Claim the snapshot for this process. Fails while another holder's lock file exists.
    ///
    /// # Errors
    /// Returns an error when the lock is held or the lock file cannot be created.
    pub fn try_lock(&self) -> Result<SnapshotLock> {
        self.ensure_parent()?;
        let lock_path = self.lock_path();
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&lock_path).unwrap_or_default();
                return Err(anyhow!(
                    "snapshot {} is owned by another process ({}); stop it or remove {}",
                    self.path.display(),
                    holder.trim(),
                    lock_path.display()
                ));
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to create lock file {}", lock_path.display()))
            }
        };
        writeln!(file, "pid={}", std::process::id())
            .with_context(|| format!("failed to write lock file {}", lock_path.display()))?;
        Ok(SnapshotLock { path: lock_path })
    }

    /// Claim the snapshot unconditionally, replacing any lock file left behind by a holder
    /// that exited without releasing it. Returns the replaced holder's marker.
    ///
    /// # Errors
    /// Returns an error when the lock file cannot be read or written.
    pub fn claim(&self) -> Result<(SnapshotLock, Option<String>)> {
        self.ensure_parent()?;
        let lock_path = self.lock_path();
        let previous = match fs::read_to_string(&lock_path) {
            Ok(holder) => Some(holder.trim().to_string()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read lock file {}", lock_path.display()))
            }
        };
        fs::write(&lock_path, format!("pid={}\n", std::process::id()))
            .with_context(|| format!("failed to write lock file {}", lock_path.display()))?;
        Ok((SnapshotLock { path: lock_path }, previous))
    }

    /// Load the snapshot, falling back to the backup when the primary is unreadable.
    ///
    /// A missing file or a primary with no content yields an empty store.
    ///
    /// # Errors
    /// Returns an error when the primary is unreadable and the backup is missing or unreadable
    /// too.
    pub fn load(&self) -> Result<(RecruitmentStore, LoadReport)> {
        let backup_path = self.backup_path();

        let primary_error = match read_document(&self.path) {
            Ok(None) if !self.path.exists() && backup_path.exists() => {
                Some(format!("snapshot {} is missing", self.path.display()))
            }
            Ok(None) => {
                let report =
                    LoadReport { source: LoadSource::Empty, loaded: 0, skipped: Vec::new(), primary_error: None };
                return Ok((RecruitmentStore::new(), report));
            }
            Ok(Some(document)) => match RecruitmentStore::from_document(document) {
                Ok((store, skipped)) => {
                    let report = LoadReport {
                        source: LoadSource::Primary,
                        loaded: store.len(),
                        skipped,
                        primary_error: None,
                    };
                    return Ok((store, report));
                }
                Err(err) => Some(format!("{err:#}")),
            },
            Err(err) => Some(format!("{err:#}")),
        };

        let document = read_document(&backup_path)?.ok_or_else(|| {
            anyhow!(
                "snapshot {} is unreadable and no backup exists at {}",
                self.path.display(),
                backup_path.display()
            )
        })?;
        let (store, skipped) = RecruitmentStore::from_document(document)
            .with_context(|| format!("backup snapshot {} is unusable", backup_path.display()))?;
        let report =
            LoadReport { source: LoadSource::Backup, loaded: store.len(), skipped, primary_error };
        Ok((store, report))
    }

    /// Copy the current snapshot to the backup path, then atomically replace it.
    ///
    /// # Errors
    /// Returns an error when serialization, the backup copy, the staging write, or the final
    /// rename fails. The previous snapshot is untouched on failure.
    pub fn write(&self, store: &RecruitmentStore) -> Result<SnapshotReport> {
        self.ensure_parent()?;

        let bytes = serde_json::to_vec_pretty(&store.to_document()?)
            .context("failed to serialize snapshot document")?;

        let backed_up = if self.path.exists() {
            let backup_path = self.backup_path();
            let staging_path = self.staging_path("bak");
            let staged = fs::copy(&self.path, &staging_path)
                .map(|_| ())
                .and_then(|()| fs::rename(&staging_path, &backup_path));
            if let Err(err) = staged {
                let _ = fs::remove_file(&staging_path);
                return Err(err).with_context(|| {
                    format!("failed to back up snapshot to {}", backup_path.display())
                });
            }
            true
        } else {
            false
        };

        let staging_path = self.staging_path("new");
        let staged = stage(&staging_path, &bytes).and_then(|()| {
            fs::rename(&staging_path, &self.path).with_context(|| {
                format!("failed to move staging snapshot into place at {}", self.path.display())
            })
        });
        if let Err(err) = staged {
            let _ = fs::remove_file(&staging_path);
            return Err(err);
        }

        Ok(SnapshotReport {
            path: self.path.display().to_string(),
            records: store.len(),
            bytes: bytes.len(),
            sha256: sha256_hex(&bytes),
            backed_up,
        })
    }

    /// Load without mutating anything and report file digests alongside the load result.
    ///
    /// # Errors
    /// Returns an error when the snapshot cannot be read or loaded.
    pub fn inspect(&self) -> Result<SnapshotInspection> {
        let sha256 = if self.path.exists() {
            let bytes = fs::read(&self.path)
                .with_context(|| format!("failed to read snapshot {}", self.path.display()))?;
            Some(sha256_hex(&bytes))
        } else {
            None
        };
        let (_, report) = self.load()?;
        Ok(SnapshotInspection {
            path: self.path.display().to_string(),
            exists: self.path.exists(),
            sha256,
            backup_exists: self.backup_path().exists(),
            report,
        })
    }
}

/// Held claim on a snapshot file. The lock file is removed on drop.
#[derive(Debug)]
pub struct SnapshotLock {
    path: PathBuf,
}

impl SnapshotLock {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SnapshotLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn stage(staging_path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(staging_path).with_context(|| {
        format!("failed to create staging snapshot {}", staging_path.display())
    })?;
    file.write_all(bytes)
        .with_context(|| format!("failed to write staging snapshot {}", staging_path.display()))?;
    file.sync_all()
        .with_context(|| format!("failed to flush staging snapshot {}", staging_path.display()))
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(std::ffi::OsStr::to_os_string).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

fn read_document(path: &Path) -> Result<Option<Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read snapshot {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(None);
    }
    let document = serde_json::from_str::<Value>(&raw)
        .with_context(|| format!("failed to parse snapshot {}", path.display()))?;
    Ok(Some(document))
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
