pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod graph;
pub mod ids;
pub mod ingest;
pub mod publish;
pub mod reconcile;
pub mod resolver;
pub mod source;
pub mod store;
pub mod types;
pub mod union_find;
pub mod warehouse;

pub use config::R360Config;
pub use engine::{KeyEngine, RunReport};
pub use error::{R360Error, R360Result};
pub use store::{KeyStore, MemoryKeyStore, SqliteKeyStore};
pub use types::Mode;
