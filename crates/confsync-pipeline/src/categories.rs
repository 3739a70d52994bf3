use confsync_core::Category;
use serde_json::{Map, Value};

/// How one configuration category maps onto the remote API.
#[derive(Debug, Clone, Copy)]
pub struct CategorySpec {
    pub category: Category,
    /// Collection endpoint; item endpoints are `{endpoint}{id}/`.
    pub endpoint: &'static str,
    /// Natural key used to match records across instances.
    pub key_field: &'static str,
    /// Relative share of the progress budget.
    pub weight: u32,
    /// Records carry a downloadable asset in `asset_field`.
    pub asset_field: Option<&'static str>,
}

impl CategorySpec {
    pub fn item_endpoint(&self, id: &Value) -> String {
        match id {
            Value::String(s) => format!("{}{}/", self.endpoint, s),
            other => format!("{}{}/", self.endpoint, other),
        }
    }
}

/// Lookup table in processing order. Heavier categories (many records or
/// one extra call per record) get larger weights.
pub fn spec(category: Category) -> CategorySpec {
    let (endpoint, key_field, weight, asset_field) = match category {
        Category::CoreSettings => ("/api/core/settings/", "key", 1, None),
        Category::Users => ("/api/accounts/users/", "username", 1, None),
        Category::M3uSources => ("/api/m3u/accounts/", "name", 2, None),
        Category::EpgSources => ("/api/epg/sources/", "name", 2, None),
        Category::StreamProfiles => ("/api/core/streamprofiles/", "name", 1, None),
        Category::ChannelProfiles => ("/api/channels/profiles/", "name", 1, None),
        Category::ChannelGroups => ("/api/channels/groups/", "name", 1, None),
        Category::Logos => ("/api/channels/logos/", "name", 3, Some("url")),
        Category::Channels => ("/api/channels/channels/", "name", 4, None),
    };
    CategorySpec {
        category,
        endpoint,
        key_field,
        weight,
        asset_field,
    }
}

/// Server-assigned fields that must not be sent back on create/update.
const SERVER_FIELDS: &[&str] = &["id", "created_at", "updated_at"];

/// Strip server-assigned fields so a record from one instance can be
/// written to another.
pub fn portable(record: &Value) -> Value {
    match record {
        Value::Object(map) => {
            let cleaned: Map<String, Value> = map
                .iter()
                .filter(|(k, _)| !SERVER_FIELDS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Value::Object(cleaned)
        }
        other => other.clone(),
    }
}

/// The record's natural key as a string, if present and non-empty.
pub fn natural_key(record: &Value, key_field: &str) -> Option<String> {
    match record.get(key_field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn users_match_on_username_everything_else_on_name() {
        for category in Category::ALL {
            let expected = match category {
                Category::Users => "username",
                Category::CoreSettings => "key",
                _ => "name",
            };
            assert_eq!(spec(category).key_field, expected, "{category}");
        }
    }

    #[test]
    fn portable_strips_server_fields_only() {
        let rec = json!({"id": 7, "name": "News", "created_at": "x", "updated_at": "y", "channel_count": 3});
        assert_eq!(portable(&rec), json!({"name": "News", "channel_count": 3}));
    }

    #[test]
    fn item_endpoint_formats_numeric_and_string_ids() {
        let s = spec(Category::ChannelGroups);
        assert_eq!(s.item_endpoint(&json!(12)), "/api/channels/groups/12/");
        assert_eq!(s.item_endpoint(&json!("ab")), "/api/channels/groups/ab/");
    }

    #[test]
    fn natural_key_rejects_missing_and_empty() {
        assert_eq!(natural_key(&json!({"name": "A"}), "name").as_deref(), Some("A"));
        assert_eq!(natural_key(&json!({"name": ""}), "name"), None);
        assert_eq!(natural_key(&json!({"title": "A"}), "name"), None);
    }
}
