mod client;

pub use client::{Client, ClientError, Config, ConfigBuilder, ServerRx, Stats};
pub use client::connect_with_config;
pub use openai_realtime_types as types;
