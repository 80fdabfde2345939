//! Disaggregated prefill/decode proxy.
//!
//! Each completion request is sent to a prefill instance capped at one
//! token, then re-issued to a decode instance together with the KV transfer
//! parameters the prefill instance returned. The decode stream is relayed to
//! the caller, with per-phase timings logged and merged into the first chunk.

pub mod client_pool;
pub mod config;
pub mod context;
pub mod error;
pub mod io_struct;
pub mod lb_state;
pub mod logging;
pub mod server;
pub mod strategy_lb;
pub mod timing;

pub use config::ProxyConfig;
pub use error::{ConfigError, DispatchError, MetadataInjectionError};
pub use lb_state::ProxyState;
