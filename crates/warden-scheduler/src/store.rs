use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::error::Result;
use crate::schedule::compute_next_run_ms;
use crate::types::{CronJob, Payload, Schedule};

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct JobFile {
    #[serde(default)]
    jobs: Vec<CronJob>,
}

/// JSON-file-backed job store, mirroring the original `jobs.json` layout:
/// the whole job list is rewritten (via a `.tmp` + rename) on every mutation
/// rather than incrementally appended, so the on-disk file is always valid
/// JSON even if the process is killed mid-write.
pub struct JobStore {
    path: PathBuf,
    jobs: Mutex<Vec<CronJob>>,
}

impl JobStore {
    /// Load `path`, creating an empty store if it doesn't exist yet.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let jobs = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str::<JobFile>(&raw)?.jobs
            }
        } else {
            Vec::new()
        };
        Ok(Self {
            path,
            jobs: Mutex::new(jobs),
        })
    }

    fn save(&self, jobs: &[CronJob]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_string_pretty(&JobFile {
            jobs: jobs.to_vec(),
        })?;
        let tmp = tmp_path(&self.path);
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn add_job(&self, name: String, schedule: Schedule, payload: Payload) -> Result<CronJob> {
        self.add_job_with_flags(name, schedule, payload, false)
    }

    pub fn add_job_with_flags(
        &self,
        name: String,
        schedule: Schedule,
        payload: Payload,
        delete_after_run: bool,
    ) -> Result<CronJob> {
        let now_ms = Utc::now().timestamp_millis();
        let next_run_at_ms = compute_next_run_ms(&schedule, now_ms);
        let job = CronJob {
            id: Uuid::new_v4().to_string(),
            name,
            enabled: true,
            schedule,
            payload,
            delete_after_run,
            next_run_at_ms,
            last_run_at_ms: None,
            run_count: 0,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        };

        let mut jobs = self.jobs.lock().unwrap();
        jobs.push(job.clone());
        self.save(&jobs)?;
        info!(job_id = %job.id, name = %job.name, "cron job added");
        Ok(job)
    }

    pub fn remove_job(&self, id: &str) -> Result<bool> {
        let mut jobs = self.jobs.lock().unwrap();
        let before = jobs.len();
        jobs.retain(|j| j.id != id);
        let removed = jobs.len() != before;
        if removed {
            self.save(&jobs)?;
            info!(job_id = %id, "cron job removed");
        }
        Ok(removed)
    }

    pub fn enable_job(&self, id: &str, enabled: bool) -> Result<Option<CronJob>> {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.iter_mut().find(|j| j.id == id) else {
            return Ok(None);
        };
        job.enabled = enabled;
        job.updated_at_ms = Utc::now().timestamp_millis();
        let updated = job.clone();
        self.save(&jobs)?;
        Ok(Some(updated))
    }

    pub fn list_jobs(&self, include_disabled: bool) -> Vec<CronJob> {
        let jobs = self.jobs.lock().unwrap();
        jobs.iter()
            .filter(|j| include_disabled || j.enabled)
            .cloned()
            .collect()
    }

    pub fn get_job(&self, id: &str) -> Option<CronJob> {
        self.jobs.lock().unwrap().iter().find(|j| j.id == id).cloned()
    }

    /// Jobs whose `next_run_at_ms` has arrived, enabled only.
    pub fn due_jobs(&self, now_ms: i64) -> Vec<CronJob> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|j| j.enabled && j.next_run_at_ms.is_some_and(|t| t <= now_ms))
            .cloned()
            .collect()
    }

    /// Records a fire: advances `next_run_at_ms`/`run_count`/`last_run_at_ms`,
    /// and drops the job entirely if it is one-shot or its schedule is
    /// exhausted (no further `next_run_at_ms`).
    pub fn record_fire(&self, id: &str, fired_at_ms: i64) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let mut drop_job = false;
        if let Some(job) = jobs.iter_mut().find(|j| j.id == id) {
            job.last_run_at_ms = Some(fired_at_ms);
            job.run_count += 1;
            job.updated_at_ms = fired_at_ms;
            let next = compute_next_run_ms(&job.schedule, fired_at_ms);
            job.next_run_at_ms = next;
            if job.delete_after_run || next.is_none() {
                drop_job = true;
            }
        }
        if drop_job {
            jobs.retain(|j| j.id != id);
        }
        self.save(&jobs)?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_payload() -> Payload {
        Payload::Text {
            message: "good morning".to_string(),
            deliver: false,
            to: None,
            channel: None,
        }
    }

    #[test]
    fn add_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cron/jobs.json");
        let store = JobStore::load(&path).unwrap();
        let job = store
            .add_job(
                "morning".to_string(),
                Schedule::Every { every_ms: 3_600_000 },
                text_payload(),
            )
            .unwrap();

        let reloaded = JobStore::load(&path).unwrap();
        let jobs = reloaded.list_jobs(true);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, job.id);
    }

    #[test]
    fn at_job_is_removed_after_firing() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::load(dir.path().join("jobs.json")).unwrap();
        let job = store
            .add_job(
                "once".to_string(),
                Schedule::At { at_ms: 1 },
                text_payload(),
            )
            .unwrap();

        store.record_fire(&job.id, 2).unwrap();
        assert!(store.get_job(&job.id).is_none());
    }

    #[test]
    fn recurring_job_survives_fire() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::load(dir.path().join("jobs.json")).unwrap();
        let job = store
            .add_job(
                "heartbeat".to_string(),
                Schedule::Every { every_ms: 1_000 },
                text_payload(),
            )
            .unwrap();

        store.record_fire(&job.id, 10_000).unwrap();
        let updated = store.get_job(&job.id).unwrap();
        assert_eq!(updated.run_count, 1);
        assert_eq!(updated.next_run_at_ms, Some(11_000));
    }

    #[test]
    fn disabled_jobs_excluded_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::load(dir.path().join("jobs.json")).unwrap();
        let job = store
            .add_job(
                "toggle".to_string(),
                Schedule::Every { every_ms: 1_000 },
                text_payload(),
            )
            .unwrap();
        store.enable_job(&job.id, false).unwrap();

        assert_eq!(store.list_jobs(false).len(), 0);
        assert_eq!(store.list_jobs(true).len(), 1);
    }
}
