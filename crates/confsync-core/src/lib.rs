//! Shared building blocks for confsync: configuration, the error taxonomy
//! every subsystem maps into, and the category/task vocabulary.

pub mod config;
pub mod error;
pub mod types;

pub use config::ConfsyncConfig;
pub use error::{ConfsyncError, Result};
pub use types::{new_id, Category, CategorySet, TaskKind};
