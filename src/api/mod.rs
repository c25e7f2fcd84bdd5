//! Polymarket API clients for activity polling and trade execution.

mod clob_client;
mod data_client;
mod error;
mod retry;
mod types;

pub use clob_client::{
    ClobClient, ExchangeClient, OrderAck, OrderFill, OrderRequest, OrderState, OrderType,
};
pub use data_client::{decode_activity, fold_positions, ActivitySource, DataClient, TargetPositionSource};
pub use error::ApiError;
pub use retry::RetryPolicy;
pub use types::*;
