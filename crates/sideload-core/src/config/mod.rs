//! Configuration: `sideload.toml` schema, parsing and storage.

pub mod parser;
pub mod paths;
pub mod schema;
pub mod store;

pub use parser::{parse_config, parse_config_str, to_toml};
pub use schema::{HeartbeatConfig, InstallConfig, SessionConfig, SideloadConfig};
pub use store::ConfigStore;
