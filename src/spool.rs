use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;

use crate::error::AppError;
use crate::event::HardwareEvent;

/// On-disk FIFO of not-yet-confirmed events. One JSON file per record,
/// named so that lexicographic order is arrival order; a `.tmp` sibling is
/// used during the atomic write and is never drained.
pub struct Spool {
    dir: PathBuf,
    seq: AtomicU64,
}

impl Spool {
    /// Opens (and creates) the spool directory. Stale `.tmp` files from a
    /// crash mid-write were never committed and are swept here. The sequence
    /// counter resumes past the highest committed suffix so a record written
    /// in the same millisecond as a pre-restart record still sorts after it.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, AppError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|e| AppError::Spool(format!("create {}: {e}", dir.display())))?;

        let mut next_seq = 0u64;
        for entry in fs::read_dir(&dir)
            .map_err(|e| AppError::Spool(format!("list {}: {e}", dir.display())))?
            .flatten()
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "tmp") {
                warn!("sweeping uncommitted spool file {}", path.display());
                let _ = fs::remove_file(&path);
            } else if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(seq) = parse_seq_suffix(&path) {
                    next_seq = next_seq.max(seq + 1);
                }
            }
        }

        Ok(Self {
            dir,
            seq: AtomicU64::new(next_seq),
        })
    }

    /// Durably appends one event: serialize, write to a temp file, rename.
    /// The rename is the commit point; a crash before it leaves no record.
    pub fn append(&self, event: &HardwareEvent) -> Result<PathBuf, AppError> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let name = format!("{millis:013}-{seq:06}.json");

        let body = serde_json::to_vec(event)
            .map_err(|e| AppError::Spool(format!("serialize event: {e}")))?;

        let final_path = self.dir.join(&name);
        let tmp_path = self.dir.join(format!("{name}.tmp"));
        fs::write(&tmp_path, &body)
            .map_err(|e| AppError::Spool(format!("write {}: {e}", tmp_path.display())))?;
        fs::rename(&tmp_path, &final_path)
            .map_err(|e| AppError::Spool(format!("commit {}: {e}", final_path.display())))?;

        Ok(final_path)
    }

    /// Oldest committed record, by filename. `.tmp` and foreign files are
    /// ignored.
    pub fn oldest(&self) -> Result<Option<PathBuf>, AppError> {
        Ok(self.pending()?.into_iter().next())
    }

    /// All committed records in arrival order.
    pub fn pending(&self) -> Result<Vec<PathBuf>, AppError> {
        let mut records: Vec<PathBuf> = fs::read_dir(&self.dir)
            .map_err(|e| AppError::Spool(format!("list {}: {e}", self.dir.display())))?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        records.sort();
        Ok(records)
    }

    pub fn remove(&self, path: &Path) -> Result<(), AppError> {
        fs::remove_file(path)
            .map_err(|e| AppError::Spool(format!("remove {}: {e}", path.display())))
    }

    /// Sidelines a record that cannot be processed so it stops blocking the
    /// FIFO; bytes are preserved under an `.err` suffix for inspection.
    pub fn sideline(&self, path: &Path) {
        let mut err_path = path.to_path_buf();
        err_path.set_extension("err");
        if let Err(e) = fs::rename(path, &err_path) {
            warn!("failed to sideline {}: {e}", path.display());
        }
    }

    pub fn is_empty(&self) -> Result<bool, AppError> {
        Ok(self.pending()?.is_empty())
    }
}

/// Sequence suffix of a committed record name (`{millis}-{seq}.json`).
fn parse_seq_suffix(path: &Path) -> Option<u64> {
    path.file_stem()?
        .to_str()?
        .rsplit_once('-')?
        .1
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tempfile::TempDir;

    use super::*;

    fn event(selector: i64) -> HardwareEvent {
        HardwareEvent {
            hardware_board_id: 1,
            extender_bus_id: 1,
            extender_bus_name: "Bus0".into(),
            extender_bit_id: selector,
            extender_bit_name: format!("Bus0_Bit{selector}"),
            bit_index: 0,
            input_selector_id: selector,
            input_selector_name: "SW".into(),
            pressed: true,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn records_drain_in_arrival_order() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path()).unwrap();

        for i in 0..5 {
            spool.append(&event(i)).unwrap();
        }

        let pending = spool.pending().unwrap();
        assert_eq!(pending.len(), 5);
        for (i, path) in pending.iter().enumerate() {
            let parsed: HardwareEvent =
                serde_json::from_slice(&fs::read(path).unwrap()).unwrap();
            assert_eq!(parsed.input_selector_id, i as i64);
        }

        let oldest = spool.oldest().unwrap().unwrap();
        assert_eq!(oldest, pending[0]);
        spool.remove(&oldest).unwrap();
        assert_eq!(spool.pending().unwrap().len(), 4);
    }

    #[test]
    fn tmp_files_are_never_drained_and_swept_on_open() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path()).unwrap();
        spool.append(&event(1)).unwrap();

        let stray = dir.path().join("9999999999999-000000.json.tmp");
        fs::write(&stray, b"partial").unwrap();

        assert_eq!(spool.pending().unwrap().len(), 1);

        // Reopen simulates a restart after a crash mid-write.
        let spool = Spool::open(dir.path()).unwrap();
        assert!(!stray.exists());
        assert_eq!(spool.pending().unwrap().len(), 1);
    }

    #[test]
    fn sequence_resumes_past_existing_records_after_reopen() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path()).unwrap();
        let before: Vec<_> = (0..3).map(|i| spool.append(&event(i)).unwrap()).collect();

        // Restart in the same millisecond must not produce a name that
        // collides with or sorts before a pre-restart record.
        let spool = Spool::open(dir.path()).unwrap();
        let after = spool.append(&event(3)).unwrap();
        assert!(after.file_name().unwrap().to_str().unwrap().ends_with("-000003.json"));
        assert!(before.iter().all(|p| p < &after));

        let pending = spool.pending().unwrap();
        assert_eq!(pending.len(), 4);
        assert_eq!(pending[3], after);
    }

    #[test]
    fn sidelined_records_leave_the_queue() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path()).unwrap();
        let path = spool.append(&event(1)).unwrap();
        spool.sideline(&path);
        assert!(spool.is_empty().unwrap());
        assert!(path.with_extension("err").exists());
    }
}
