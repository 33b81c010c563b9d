pub mod audit;
pub mod client;
pub mod cluster;
pub mod error;
pub mod index;
pub mod json;
pub mod maintenance;
pub mod node_config;
pub mod policies;
pub mod replicate;
pub mod request;
pub mod settings;

pub use error::{Error, Result};
