pub mod database;
pub mod file_store;

pub use file_store::{JsonDirSourceStore, JsonDirTargetStore};
