use confsync_pipeline::BackupStore;
use tracing::{debug, info, warn};

use crate::store::ScheduleStore;

/// Keep the newest `keep` backups of a schedule and delete the rest, along
/// with the run-history entries of the jobs that produced them.
///
/// Never fails: problems are logged and the affected backup is left in
/// place. Returns the number of backups removed.
pub fn apply_retention(
    store: &ScheduleStore,
    backups: &BackupStore,
    schedule_id: &str,
    keep: usize,
) -> usize {
    let records = match backups.list_for_schedule(schedule_id) {
        Ok(records) => records,
        Err(e) => {
            warn!(schedule_id, error = %e, "retention: could not list backups");
            return 0;
        }
    };
    if records.len() <= keep {
        debug!(schedule_id, total = records.len(), keep, "retention: nothing to remove");
        return 0;
    }

    let mut removed_jobs = Vec::new();
    for record in records.into_iter().skip(keep) {
        match backups.delete(&record.id) {
            Ok(_) => removed_jobs.push(record.job_id),
            Err(e) => warn!(schedule_id, backup_id = %record.id, error = %e, "retention: delete failed"),
        }
    }

    if let Err(e) = store.delete_runs_for_jobs(schedule_id, &removed_jobs) {
        warn!(schedule_id, error = %e, "retention: could not trim run history");
    }
    info!(schedule_id, removed = removed_jobs.len(), keep, "retention applied");
    removed_jobs.len()
}
