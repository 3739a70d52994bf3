use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Fresh identifier for jobs, schedules, connections and backups
/// (UUIDv7, so ids sort by creation time in logs and tables).
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

/// The three long-running operations the pipeline knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Backup,
    Restore,
    Sync,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Backup => "backup",
            TaskKind::Restore => "restore",
            TaskKind::Sync => "sync",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "backup" => Ok(TaskKind::Backup),
            "restore" => Ok(TaskKind::Restore),
            "sync" => Ok(TaskKind::Sync),
            other => Err(format!("unknown task kind: {other}")),
        }
    }
}

/// A configuration category that can be copied between instances.
///
/// Declaration order is the processing order: categories that others
/// reference (users, sources, profiles, groups, logos) come before the
/// channels that point at them. `Ord` is derived so a `BTreeSet` iterates
/// in exactly this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    CoreSettings,
    Users,
    M3uSources,
    EpgSources,
    StreamProfiles,
    ChannelProfiles,
    ChannelGroups,
    Logos,
    Channels,
}

impl Category {
    pub const ALL: [Category; 9] = [
        Category::CoreSettings,
        Category::Users,
        Category::M3uSources,
        Category::EpgSources,
        Category::StreamProfiles,
        Category::ChannelProfiles,
        Category::ChannelGroups,
        Category::Logos,
        Category::Channels,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::CoreSettings => "core_settings",
            Category::Users => "users",
            Category::M3uSources => "m3u_sources",
            Category::EpgSources => "epg_sources",
            Category::StreamProfiles => "stream_profiles",
            Category::ChannelProfiles => "channel_profiles",
            Category::ChannelGroups => "channel_groups",
            Category::Logos => "logos",
            Category::Channels => "channels",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Category::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown category: {s}"))
    }
}

/// Closed set of categories selected for one operation.
///
/// Serialises as a JSON array of category names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CategorySet(BTreeSet<Category>);

impl CategorySet {
    pub fn all() -> Self {
        Self(Category::ALL.into_iter().collect())
    }

    pub fn empty() -> Self {
        Self(BTreeSet::new())
    }

    pub fn contains(&self, category: Category) -> bool {
        self.0.contains(&category)
    }

    pub fn insert(&mut self, category: Category) -> bool {
        self.0.insert(category)
    }

    pub fn remove(&mut self, category: Category) -> bool {
        self.0.remove(&category)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Categories in processing order.
    pub fn iter(&self) -> impl Iterator<Item = Category> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<Category> for CategorySet {
    fn from_iter<I: IntoIterator<Item = Category>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_set_iterates_in_processing_order() {
        let set: CategorySet = [Category::Channels, Category::Users, Category::Logos]
            .into_iter()
            .collect();
        let order: Vec<_> = set.iter().collect();
        assert_eq!(order, vec![Category::Users, Category::Logos, Category::Channels]);
    }

    #[test]
    fn category_set_serialises_as_name_list() {
        let set: CategorySet = [Category::ChannelGroups, Category::M3uSources]
            .into_iter()
            .collect();
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, r#"["m3u_sources","channel_groups"]"#);

        let back: CategorySet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }

    #[test]
    fn unknown_category_name_is_rejected() {
        assert!(serde_json::from_str::<CategorySet>(r#"["channels","playlists"]"#).is_err());
        assert!("playlists".parse::<Category>().is_err());
        assert_eq!("epg_sources".parse::<Category>(), Ok(Category::EpgSources));
    }
}
