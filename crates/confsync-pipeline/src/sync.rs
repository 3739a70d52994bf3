use confsync_core::CategorySet;
use serde_json::{json, Map, Value};
use tracing::info;

use crate::categories;
use crate::connections::ConnectionProfile;
use crate::context::JobContext;
use crate::error::{PipelineError, Result};
use crate::executor::Pipeline;
use crate::paginate::fetch_all;
use crate::progress::ProgressTracker;
use crate::upsert::upsert_records;

/// Copy the selected categories from `source` straight into `destination`.
pub(crate) async fn run(
    pipeline: &Pipeline,
    ctx: &JobContext,
    source: &ConnectionProfile,
    destination: &ConnectionProfile,
    categories: &CategorySet,
) -> Result<Value> {
    if source.id == destination.id {
        return Err(PipelineError::Validation(
            "source and destination must be different connections".into(),
        ));
    }

    let src = pipeline.connect(ctx, source).await?;
    let dest = pipeline.connect(ctx, destination).await?;
    let mut tracker = ProgressTracker::new(categories, 0);
    let mut summary = Map::new();

    for category in categories.iter() {
        ctx.checkpoint()?;
        let spec = categories::spec(category);
        tracker.begin_category(category);
        ctx.milestone(tracker.percent(), &format!("Syncing {category}"))?;

        let records = fetch_all(ctx, src.as_ref(), spec.endpoint, pipeline.page_size).await?;
        let stats = upsert_records(ctx, dest.as_ref(), &spec, &records, pipeline.page_size, &mut tracker).await?;
        summary.insert(category.to_string(), serde_json::to_value(&stats)?);
        ctx.progress(tracker.finish_step(), &format!("Synced {category}"))?;
    }

    let errors: u64 = summary.values().filter_map(|v| v["errors"].as_u64()).sum();
    ctx.milestone(100, "Sync complete")?;
    info!(
        job_id = %ctx.job_id(),
        source = %source.name,
        destination = %destination.name,
        errors,
        "sync finished"
    );
    Ok(json!({ "categories": summary, "errors": errors }))
}
