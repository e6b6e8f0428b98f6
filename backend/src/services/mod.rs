//! Business logic services

pub mod alert;
pub mod archive;
pub mod block;
pub mod harvest;
pub mod plant_data;
pub mod query_cache;
pub mod query_engine;
pub mod schema_discovery;

pub use alert::AlertService;
pub use archive::ArchiveService;
pub use block::BlockService;
pub use harvest::HarvestService;
pub use plant_data::PlantDataService;
pub use query_engine::{QueryEngine, QueryEngineConfig, QueryExecutionError};
pub use schema_discovery::SchemaDiscovery;
