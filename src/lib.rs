pub mod applier;
pub mod client;
pub mod data_url;
pub mod dsl;
pub mod error;
pub mod graph;
pub mod orchestrator;
pub mod protocol;
pub mod resolver;
pub mod schema;
pub mod settings;
pub mod temp_store;
pub mod transport;
