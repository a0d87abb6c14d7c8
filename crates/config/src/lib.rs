//! Configuration loading: `potat.{toml,yaml,yml,json}` discovery with
//! `${ENV_VAR}` substitution.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{
        clear_config_dir, config_dir, discover_and_load, find_config_file,
        find_or_default_config_path, load_config, set_config_dir,
    },
    schema::{
        BrokerConfig, BusBackend, MetricsConfig, PotatConfig, RateLimitConfig, RedisConfig,
        SocketConfig, StoreBackend,
    },
};
