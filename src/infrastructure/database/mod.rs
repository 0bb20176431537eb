pub mod db;

pub use db::{DatabaseManager, MongoSourceStore, MongoTargetStore};
