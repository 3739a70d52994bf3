use std::path::Path;

use confsync_core::CategorySet;
use serde_json::{json, Map, Value};
use tracing::info;

use crate::artifacts;
use crate::backup::{FORMAT_VERSION, MANIFEST_FILE};
use crate::categories;
use crate::connections::ConnectionProfile;
use crate::context::JobContext;
use crate::error::{PipelineError, Result};
use crate::executor::Pipeline;
use crate::progress::ProgressTracker;
use crate::upsert::upsert_records;

pub(crate) async fn run(
    pipeline: &Pipeline,
    ctx: &JobContext,
    destination: &ConnectionProfile,
    backup_id: &str,
    categories: &CategorySet,
) -> Result<Value> {
    let record = pipeline
        .backups
        .get(backup_id)?
        .ok_or_else(|| PipelineError::NotFound {
            what: "backup",
            id: backup_id.to_string(),
        })?;
    let archive = pipeline.backups.path_of(&record);
    if !archive.exists() {
        return Err(PipelineError::NotFound {
            what: "backup file",
            id: record.filename,
        });
    }

    let job_id = ctx.job_id().to_string();
    let work = pipeline.work_dirs.create(&job_id)?;
    let result = import(pipeline, ctx, destination, &archive, categories, &work).await;
    pipeline.work_dirs.cleanup(&job_id);
    result
}

async fn import(
    pipeline: &Pipeline,
    ctx: &JobContext,
    destination: &ConnectionProfile,
    archive: &Path,
    requested: &CategorySet,
    work: &Path,
) -> Result<Value> {
    let mut tracker = ProgressTracker::new(requested, 1);

    tracker.begin_step(1);
    ctx.milestone(tracker.percent(), "Extracting archive")?;
    let (src, dest) = (archive.to_path_buf(), work.to_path_buf());
    tokio::task::spawn_blocking(move || artifacts::extract_archive(&src, &dest))
        .await
        .map_err(|e| PipelineError::Archive(e.to_string()))??;

    let manifest: Value = serde_json::from_slice(&tokio::fs::read(work.join(MANIFEST_FILE)).await?)?;
    let version = manifest["format_version"].as_u64().unwrap_or(0);
    if version != FORMAT_VERSION as u64 {
        return Err(PipelineError::Archive(format!(
            "unsupported backup format version {version}"
        )));
    }
    let available: CategorySet = serde_json::from_value(manifest["categories"].clone())?;
    tracker.finish_step();

    let client = pipeline.connect(ctx, destination).await?;
    let mut summary = Map::new();

    for category in requested.iter() {
        ctx.checkpoint()?;
        tracker.begin_category(category);
        if !available.contains(category) {
            ctx.log(format!("{category} not present in backup; skipped"))?;
            ctx.progress(tracker.finish_step(), &format!("Skipped {category}"))?;
            continue;
        }
        ctx.milestone(tracker.percent(), &format!("Restoring {category}"))?;

        let records: Vec<Value> =
            serde_json::from_slice(&tokio::fs::read(work.join(format!("{category}.json"))).await?)?;
        let spec = categories::spec(category);
        let stats = upsert_records(ctx, client.as_ref(), &spec, &records, pipeline.page_size, &mut tracker).await?;
        summary.insert(category.to_string(), serde_json::to_value(&stats)?);
        ctx.progress(tracker.finish_step(), &format!("Restored {category}"))?;
    }

    let errors: u64 = summary.values().filter_map(|v| v["errors"].as_u64()).sum();
    ctx.milestone(100, "Restore complete")?;
    info!(job_id = %ctx.job_id(), destination = %destination.name, errors, "restore finished");
    Ok(json!({ "categories": summary, "errors": errors }))
}
