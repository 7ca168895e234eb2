use anyhow::{anyhow, Context, Result};
use raid_roster_store_json::{LoadReport, RecruitmentStore, SnapshotFile, SnapshotReport};
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

/// Owns the snapshot file and orders concurrent snapshot writers.
#[derive(Debug)]
pub struct PersistenceManager {
    file: SnapshotFile,
    writer: Mutex<()>,
}

impl PersistenceManager {
    #[must_use]
    pub fn new(file: SnapshotFile) -> Self {
        Self { file, writer: Mutex::new(()) }
    }

    #[must_use]
    pub fn file(&self) -> &SnapshotFile {
        &self.file
    }

    /// Load the store at startup. Any failure yields an empty store; the error is logged.
    pub fn load(&self) -> (RecruitmentStore, Option<LoadReport>) {
        match self.file.load() {
            Ok((store, report)) => {
                for skipped in &report.skipped {
                    warn!(
                        path = %self.file.path().display(),
                        key = %skipped.key,
                        reason = %skipped.reason,
                        "skipped malformed recruitment record"
                    );
                }
                if let Some(primary_error) = &report.primary_error {
                    warn!(
                        path = %self.file.path().display(),
                        error = %primary_error,
                        "primary snapshot unusable; loaded backup"
                    );
                }
                info!(
                    path = %self.file.path().display(),
                    source = ?report.source,
                    loaded = report.loaded,
                    skipped = report.skipped.len(),
                    "recruitment store loaded"
                );
                (store, Some(report))
            }
            Err(err) => {
                error!(
                    path = %self.file.path().display(),
                    error = %format!("{err:#}"),
                    "failed to load recruitment store; starting empty"
                );
                (RecruitmentStore::new(), None)
            }
        }
    }

    /// Write a full snapshot of `store`.
    ///
    /// The store is copied only after this writer's turn comes up, so snapshots land on disk
    /// in the order their copies were taken.
    ///
    /// # Errors
    /// Returns an error when the blocking write task fails or the snapshot cannot be written.
    pub async fn save(&self, store: &RwLock<RecruitmentStore>) -> Result<SnapshotReport> {
        let _turn = self.writer.lock().await;
        let copy = store.read().await.clone();
        let file = self.file.clone();
        tokio::task::spawn_blocking(move || file.write(&copy))
            .await
            .context("snapshot write task did not complete")?
    }

    /// [`Self::save`] with failures logged instead of returned.
    pub async fn save_logged(&self, store: &RwLock<RecruitmentStore>) -> Option<SnapshotReport> {
        match self.save(store).await {
            Ok(report) => {
                tracing::debug!(
                    path = %report.path,
                    records = report.records,
                    sha256 = %report.sha256,
                    "snapshot written"
                );
                Some(report)
            }
            Err(err) => {
                error!(
                    path = %self.file.path().display(),
                    error = %format!("{err:#}"),
                    "snapshot failed; will retry on next save"
                );
                None
            }
        }
    }

    /// Synchronous last-chance snapshot for the crash path. Skipped while another snapshot
    /// write holds the writer turn.
    ///
    /// # Errors
    /// Returns an error when a snapshot write is in flight, the store is write-locked, or the
    /// write fails.
    pub fn emergency_save(&self, store: &RwLock<RecruitmentStore>) -> Result<SnapshotReport> {
        let _turn = self
            .writer
            .try_lock()
            .map_err(|_| anyhow!("snapshot write in progress; emergency snapshot skipped"))?;
        let copy = store
            .try_read()
            .map_err(|_| anyhow!("recruitment store is locked; emergency snapshot skipped"))?
            .clone();
        self.file.write(&copy)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use super::*;
    use raid_roster_core::{ActivityKind, ActorId, Recruitment, TimeSlot};
    use raid_roster_store_json::LoadSource;
    use time::macros::{date, datetime};

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("raid-roster-persist-{}", ulid::Ulid::new()))
    }

    fn mk_pending() -> Recruitment {
        Recruitment::new_pending(
            ActivityKind::Tengen,
            date!(2026 - 10 - 20),
            TimeSlot::NOW,
            ActorId::new("organizer"),
            datetime!(2026-10-10 12:00 UTC),
        )
    }

    // Test IDs: TPER-001
    #[tokio::test]
    async fn save_then_load_restores_store() -> Result<()> {
        let dir = temp_dir();
        let manager = PersistenceManager::new(SnapshotFile::in_dir(&dir));
        let store = RwLock::new(RecruitmentStore::new());
        store.write().await.put(mk_pending());
        store.write().await.put(mk_pending());

        let report = manager.save(&store).await?;
        assert_eq!(report.records, 2);

        let (loaded, load_report) = manager.load();
        assert_eq!(loaded, *store.read().await);
        assert_eq!(load_report.map(|report| report.source), Some(LoadSource::Primary));

        fs::remove_dir_all(&dir).context("failed to cleanup temp dir")?;
        Ok(())
    }

    // Test IDs: TPER-002
    #[tokio::test]
    async fn unreadable_snapshot_starts_empty() -> Result<()> {
        let dir = temp_dir();
        fs::create_dir_all(&dir)?;
        let file = SnapshotFile::in_dir(&dir);
        fs::write(file.path(), "[1, 2, 3]")?;

        let manager = PersistenceManager::new(file);
        let (store, report) = manager.load();
        assert!(store.is_empty());
        assert!(report.is_none());

        fs::remove_dir_all(&dir).context("failed to cleanup temp dir")?;
        Ok(())
    }

    // Test IDs: TPER-003
    #[tokio::test]
    async fn failed_save_is_reported_not_raised() -> Result<()> {
        let dir = temp_dir();
        fs::create_dir_all(&dir)?;
        let blocker = dir.join("not-a-dir");
        fs::write(&blocker, "file in the way")?;

        let manager = PersistenceManager::new(SnapshotFile::in_dir(&blocker));
        let store = RwLock::new(RecruitmentStore::new());
        assert!(manager.save_logged(&store).await.is_none());

        fs::remove_dir_all(&dir).context("failed to cleanup temp dir")?;
        Ok(())
    }

    // Test IDs: TPER-004
    #[tokio::test]
    async fn emergency_save_skips_when_store_is_write_locked() -> Result<()> {
        let dir = temp_dir();
        let manager = PersistenceManager::new(SnapshotFile::in_dir(&dir));
        let store = RwLock::new(RecruitmentStore::new());

        {
            let _writer = store.write().await;
            assert!(manager.emergency_save(&store).is_err());
        }
        let report = manager.emergency_save(&store)?;
        assert_eq!(report.records, 0);

        fs::remove_dir_all(&dir).context("failed to cleanup temp dir")?;
        Ok(())
    }

    // Test IDs: TPER-005
    #[tokio::test]
    async fn emergency_save_skips_while_a_write_is_in_flight() -> Result<()> {
        let dir = temp_dir();
        let manager = PersistenceManager::new(SnapshotFile::in_dir(&dir));
        let store = RwLock::new(RecruitmentStore::new());
        store.write().await.put(mk_pending());

        {
            let _in_flight = manager.writer.lock().await;
            let skipped = manager.emergency_save(&store);
            assert!(skipped.is_err_and(|err| err.to_string().contains("in progress")));
            assert!(!manager.file().path().exists());
        }
        let report = manager.emergency_save(&store)?;
        assert_eq!(report.records, 1);

        fs::remove_dir_all(&dir).context("failed to cleanup temp dir")?;
        Ok(())
    }
}
