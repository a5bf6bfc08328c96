//! # Tessera Configuration
//!
//! Runtime configuration and genesis handling for the Tessera node.
//!
//! Node settings live in a single `tessera.toml` file; the genesis
//! description (chain parameters plus the baker roster) is a separate JSON
//! document shared verbatim between all nodes of a chain.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tessera_config::{Config, GenesisConfig};
//! use std::path::Path;
//!
//! let config = Config::load(Path::new("tessera.toml"))?;
//! let genesis = GenesisConfig::load_json(Path::new("genesis.json"))?;
//! let genesis_data = genesis.into_genesis_data()?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod genesis;

pub use config::{BakerSettings, Config, FinalizationSettings, TransactionSettings};
pub use error::{ConfigError, ConfigResult};
pub use genesis::GenesisConfig;
