// Per-job checkpoint persistence, grounded on
// `registry::Registry::persist`'s write-temp/fsync/rename discipline. One
// JSON file per database; the file is the sole source of truth for resuming
// a migration across a process restart (`spec.md` §4.9 "Resume").

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{HybridRagError, Result};
use crate::types::DatabaseName;

use super::MigrationJob;

pub struct CheckpointStore;

impl CheckpointStore {
    fn path(dir: &Path, name: &DatabaseName) -> PathBuf {
        dir.join(format!("{}.json", name.as_str()))
    }

    /// Reads the checkpointed job for `name`, if one exists.
    pub fn read(dir: &Path, name: &DatabaseName) -> Result<Option<MigrationJob>> {
        let path = Self::path(dir, name);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .map_err(|e| HybridRagError::internal("failed to read migration checkpoint").with_source(e.into()))?;
        let job = serde_json::from_str(&raw)
            .map_err(|e| HybridRagError::internal("failed to parse migration checkpoint").with_source(e.into()))?;
        Ok(Some(job))
    }

    /// The `job_id` of an in-progress or previously attempted migration,
    /// required before a `--resume` call can re-claim the lease under the
    /// same id (`spec.md` §4.9 "Resume").
    pub fn existing_job_id(dir: &Path, name: &DatabaseName) -> Result<String> {
        Self::read(dir, name)?
            .map(|job| job.job_id)
            .ok_or_else(|| {
                HybridRagError::not_found(format!("no migration checkpoint to resume for {name}"))
                    .with_database(name.clone())
            })
    }

    /// Writes `job` to disk atomically: a temp file is written and fsynced,
    /// then renamed over the checkpoint path.
    pub fn save(dir: &Path, job: &MigrationJob) -> Result<()> {
        fs::create_dir_all(dir)
            .map_err(|e| HybridRagError::internal("failed to create checkpoint directory").with_source(e.into()))?;

        let path = Self::path(dir, &job.database_name);
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(job)
            .map_err(|e| HybridRagError::internal("failed to serialize migration checkpoint").with_source(e.into()))?;

        {
            let mut tmp = fs::File::create(&tmp_path).map_err(|e| {
                HybridRagError::internal("failed to create checkpoint temp file").with_source(e.into())
            })?;
            tmp.write_all(json.as_bytes()).map_err(|e| {
                HybridRagError::internal("failed to write checkpoint temp file").with_source(e.into())
            })?;
            tmp.sync_all().map_err(|e| {
                HybridRagError::internal("failed to fsync checkpoint temp file").with_source(e.into())
            })?;
        }

        fs::rename(&tmp_path, &path).map_err(|e| {
            HybridRagError::internal("failed to atomically replace migration checkpoint").with_source(e.into())
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::BackendType;
    use tempfile::tempdir;

    fn sample_job(name: &DatabaseName) -> MigrationJob {
        MigrationJob::new(
            name.clone(),
            "job-1".to_string(),
            BackendType::FileBased,
            BackendType::FileBased,
        )
    }

    #[test]
    fn test_save_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let name = DatabaseName::new("proj1").unwrap();
        let job = sample_job(&name);

        CheckpointStore::save(dir.path(), &job).unwrap();
        let loaded = CheckpointStore::read(dir.path(), &name).unwrap().unwrap();
        assert_eq!(loaded.job_id, "job-1");
        assert_eq!(loaded.database_name, name);
    }

    #[test]
    fn test_read_missing_checkpoint_is_none() {
        let dir = tempdir().unwrap();
        let name = DatabaseName::new("proj1").unwrap();
        assert!(CheckpointStore::read(dir.path(), &name).unwrap().is_none());
    }

    #[test]
    fn test_existing_job_id_errors_when_absent() {
        let dir = tempdir().unwrap();
        let name = DatabaseName::new("proj1").unwrap();
        assert!(CheckpointStore::existing_job_id(dir.path(), &name).is_err());
    }
}
