use std::path::Path;

use chrono::Utc;
use confsync_core::{new_id, CategorySet};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::artifacts::{self, BackupRecord};
use crate::categories::{self, CategorySpec};
use crate::connections::ConnectionProfile;
use crate::context::JobContext;
use crate::error::{PipelineError, Result};
use crate::executor::{BackupTarget, Pipeline};
use crate::paginate::fetch_all;
use crate::progress::ProgressTracker;
use crate::remote::RemoteClient;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const FORMAT_VERSION: u32 = 1;
const LOGO_DIR: &str = "logos";

pub(crate) async fn run(
    pipeline: &Pipeline,
    ctx: &JobContext,
    source: &ConnectionProfile,
    categories: &CategorySet,
    target: &BackupTarget,
) -> Result<Value> {
    let job_id = ctx.job_id().to_string();
    let work = pipeline.work_dirs.create(&job_id)?;

    let result = export(pipeline, ctx, source, categories, target, &work).await;

    // Download targets keep the work dir (it holds the archive) until the
    // archive is fetched or explicitly cleaned up.
    let keep = result.is_ok() && *target == BackupTarget::Download;
    if !keep {
        pipeline.work_dirs.cleanup(&job_id);
    }
    result
}

async fn export(
    pipeline: &Pipeline,
    ctx: &JobContext,
    source: &ConnectionProfile,
    categories: &CategorySet,
    target: &BackupTarget,
    work: &Path,
) -> Result<Value> {
    let client = pipeline.connect(ctx, source).await?;
    let mut tracker = ProgressTracker::new(categories, 1);
    let mut summary = Map::new();

    for category in categories.iter() {
        ctx.checkpoint()?;
        let spec = categories::spec(category);
        tracker.begin_category(category);
        ctx.milestone(tracker.percent(), &format!("Exporting {category}"))?;

        let records = fetch_all(ctx, client.as_ref(), spec.endpoint, pipeline.page_size).await?;
        let errors = match spec.asset_field {
            Some(field) => download_assets(ctx, client.as_ref(), &spec, field, &records, work, &mut tracker).await?,
            None => 0,
        };

        let file = work.join(format!("{category}.json"));
        tokio::fs::write(&file, serde_json::to_vec_pretty(&records)?).await?;
        summary.insert(
            category.to_string(),
            json!({ "total": records.len(), "errors": errors }),
        );
        ctx.progress(tracker.finish_step(), &format!("Exported {category}"))?;
    }

    ctx.checkpoint()?;
    tracker.begin_step(1);
    ctx.milestone(tracker.percent(), "Creating archive")?;

    let manifest = json!({
        "format_version": FORMAT_VERSION,
        "created_at": Utc::now(),
        "source": { "name": source.name, "base_url": source.base_url },
        "categories": categories,
    });
    tokio::fs::write(work.join(MANIFEST_FILE), serde_json::to_vec_pretty(&manifest)?).await?;

    let filename = archive_name(&source.name);
    let archive = work.join(&filename);
    let (src, dest) = (work.to_path_buf(), archive.clone());
    let sha256 = tokio::task::spawn_blocking(move || {
        artifacts::write_archive(&src, &dest)?;
        artifacts::sha256_file(&dest)
    })
    .await
    .map_err(|e| PipelineError::Archive(e.to_string()))??;
    let size_bytes = tokio::fs::metadata(&archive).await?.len();

    let errors: u64 = summary.values().filter_map(|v| v["errors"].as_u64()).sum();
    let mut result = json!({
        "categories": summary,
        "errors": errors,
        "filename": filename,
        "size_bytes": size_bytes,
        "sha256": sha256,
    });

    match target {
        BackupTarget::Download => {
            pipeline.work_dirs.set_archive(ctx.job_id(), archive);
            result["download"] = json!(true);
        }
        BackupTarget::Catalog { schedule_id } => {
            let record = BackupRecord {
                id: new_id(),
                job_id: ctx.job_id().to_string(),
                schedule_id: schedule_id.clone(),
                connection_id: source.id.clone(),
                filename: filename.clone(),
                size_bytes,
                sha256,
                categories: categories.clone(),
                created_at: Utc::now(),
            };
            move_file(&archive, &pipeline.backups.path_of(&record)).await?;
            pipeline.backups.insert(&record)?;
            result["backup_id"] = json!(record.id);
        }
    }

    ctx.milestone(tracker.finish_step(), "Backup complete")?;
    info!(job_id = %ctx.job_id(), source = %source.name, filename = %filename, "backup written");
    Ok(result)
}

/// Fetch each record's asset into `<work>/logos/`. Failures are counted,
/// not fatal.
async fn download_assets(
    ctx: &JobContext,
    client: &dyn RemoteClient,
    spec: &CategorySpec,
    field: &str,
    records: &[Value],
    work: &Path,
    tracker: &mut ProgressTracker,
) -> Result<usize> {
    let dir = work.join(LOGO_DIR);
    tokio::fs::create_dir_all(&dir).await?;
    tracker.set_items(records.len());
    let mut errors = 0;

    for (index, record) in records.iter().enumerate() {
        ctx.checkpoint()?;
        if let Some(url) = record.get(field).and_then(Value::as_str).filter(|u| !u.is_empty()) {
            let name = asset_name(record, index, url);
            match client.download(url).await {
                Ok(bytes) => tokio::fs::write(dir.join(&name), bytes).await?,
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    errors += 1;
                    warn!(job_id = %ctx.job_id(), category = %spec.category, url, error = %e, "asset download failed");
                    ctx.log(format!("{}: asset {url} failed: {e}", spec.category))?;
                }
            }
        }
        ctx.progress(tracker.item_done(), &format!("Downloading {}", spec.category))?;
    }
    Ok(errors)
}

fn asset_name(record: &Value, index: usize, url: &str) -> String {
    let stem = match record.get("id") {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => sanitize(s),
        _ => index.to_string(),
    };
    let ext = url
        .rsplit('/')
        .next()
        .and_then(|last| last.split('?').next())
        .and_then(|last| last.rsplit_once('.'))
        .map(|(_, ext)| sanitize(ext))
        .filter(|ext| !ext.is_empty() && ext.len() <= 5);
    match ext {
        Some(ext) => format!("{stem}.{ext}"),
        None => stem,
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn archive_name(source: &str) -> String {
    format!(
        "confsync-backup-{}-{}.zip",
        sanitize(source),
        Utc::now().format("%Y%m%d-%H%M%S%3f")
    )
}

async fn move_file(from: &Path, to: &Path) -> Result<()> {
    if tokio::fs::rename(from, to).await.is_err() {
        // Cross-device: copy then remove.
        tokio::fs::copy(from, to).await?;
        tokio::fs::remove_file(from).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_names_use_id_and_url_extension() {
        let rec = json!({"id": 12, "url": "http://x/logo.png?v=2"});
        assert_eq!(asset_name(&rec, 0, "http://x/logo.png?v=2"), "12.png");
        let rec = json!({"name": "BBC"});
        assert_eq!(asset_name(&rec, 4, "http://x/image"), "4");
    }

    #[test]
    fn archive_names_are_filesystem_safe() {
        let name = archive_name("Living room / TV");
        assert!(name.starts_with("confsync-backup-Living_room___TV-"));
        assert!(name.ends_with(".zip"));
    }
}
