use serde_json::Value;
use tracing::debug;

use crate::context::JobContext;
use crate::error::{PipelineError, Result};
use crate::remote::RemoteClient;

/// Fetch every record behind a list endpoint.
///
/// Paginated responses (`{"results": [...], "next": ...}`) are followed with
/// `?page=N&page_size=P` until `next` is null or a page comes back empty.
/// A bare array is returned as
/// is and a single object becomes a one-element list. The job's
/// cancellation checkpoint runs before every page.
pub async fn fetch_all(
    ctx: &JobContext,
    client: &dyn RemoteClient,
    endpoint: &str,
    page_size: u32,
) -> Result<Vec<Value>> {
    let sep = if endpoint.contains('?') { '&' } else { '?' };
    let mut records = Vec::new();
    let mut page = 1u32;

    loop {
        ctx.checkpoint()?;
        let url = format!("{endpoint}{sep}page={page}&page_size={page_size}");
        let body = client.get(&url).await?;

        match body {
            Value::Array(items) => {
                records.extend(items);
                break;
            }
            Value::Object(mut obj) if obj.contains_key("results") => {
                let fetched = match obj.remove("results") {
                    Some(Value::Array(items)) => {
                        let n = items.len();
                        records.extend(items);
                        n
                    }
                    _ => {
                        return Err(PipelineError::Validation(format!(
                            "{endpoint}: 'results' is not an array"
                        )))
                    }
                };
                let more = fetched > 0 && obj.get("next").is_some_and(|n| !n.is_null());
                debug!(endpoint, page, total = records.len(), more, "page fetched");
                if !more {
                    break;
                }
                page += 1;
            }
            Value::Null => break,
            other => {
                records.push(other);
                break;
            }
        }
    }
    Ok(records)
}
