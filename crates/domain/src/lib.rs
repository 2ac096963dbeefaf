//! Domain-level building blocks shared by the listener core and the
//! `tx-listener` binary: the chain data model, the chain client contract,
//! configuration and telemetry bootstrap.

pub mod chain;
pub mod config;
pub mod model;
pub mod services;

pub use chain::{ChainClient, ClientError, ClientResult};
pub use config::{BootstrapConfig, ConfigError, ListenerConfig, RetryConfig, StartPosition};
pub use model::{
    Block, ChainId, Header, ListenedBlock, ListenedError, ListenedReceipt, Position, Progress,
    Receipt, TxHash,
};
