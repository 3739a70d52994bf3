use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::categories::{natural_key, portable, CategorySpec};
use crate::context::JobContext;
use crate::error::Result;
use crate::paginate::fetch_all;
use crate::progress::ProgressTracker;
use crate::remote::RemoteClient;

/// Outcome counters for one category.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryStats {
    pub total: usize,
    pub created: usize,
    pub updated: usize,
    pub errors: usize,
}

/// Write `records` to the destination, matching on the category's natural
/// key: existing records are PATCHed, missing ones POSTed.
///
/// Running the same input twice yields updates only. A failing record is
/// counted and logged and the loop moves on; only fatal remote errors
/// (authentication) and cancellation abort.
pub async fn upsert_records(
    ctx: &JobContext,
    dest: &dyn RemoteClient,
    spec: &CategorySpec,
    records: &[Value],
    page_size: u32,
    progress: &mut ProgressTracker,
) -> Result<CategoryStats> {
    let category = spec.category;
    let existing = fetch_all(ctx, dest, spec.endpoint, page_size).await?;
    let mut ids: HashMap<String, Value> = existing
        .iter()
        .filter_map(|r| Some((natural_key(r, spec.key_field)?, r.get("id")?.clone())))
        .collect();
    debug!(%category, existing = ids.len(), incoming = records.len(), "upserting");

    let mut stats = CategoryStats {
        total: records.len(),
        ..CategoryStats::default()
    };
    progress.set_items(records.len());

    for record in records {
        ctx.checkpoint()?;

        let Some(key) = natural_key(record, spec.key_field) else {
            stats.errors += 1;
            ctx.log(format!("{category}: record without '{}' skipped", spec.key_field))?;
            ctx.progress(progress.item_done(), &format!("Writing {category}"))?;
            continue;
        };

        let payload = portable(record);
        let outcome = match ids.get(&key).cloned() {
            Some(id) => dest
                .patch(&spec.item_endpoint(&id), &payload)
                .await
                .map(|_| false),
            None => dest.post(spec.endpoint, &payload).await.map(|created| {
                if let Some(id) = created.get("id") {
                    ids.insert(key.clone(), id.clone());
                }
                true
            }),
        };

        match outcome {
            Ok(true) => stats.created += 1,
            Ok(false) => stats.updated += 1,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                stats.errors += 1;
                warn!(job_id = %ctx.job_id(), %category, key = %key, error = %e, "record write failed");
                ctx.log(format!("{category}: '{key}' failed: {e}"))?;
            }
        }
        ctx.progress(progress.item_done(), &format!("Writing {category}"))?;
    }

    Ok(stats)
}
