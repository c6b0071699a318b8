pub mod bus;
pub mod channel;
pub mod config;
pub mod dataset;
pub mod ingester;
pub mod pending;
pub mod processor;
pub mod schema;
pub mod shutdown;
pub mod store;
pub mod streamer;

pub use channel::{BatchIndex, ChannelKey};
pub use config::PipelineConfig;
pub use dataset::Dataset;
pub use ingester::Ingester;
pub use processor::Processor;
pub use schema::WeatherRecord;
pub use streamer::Streamer;
