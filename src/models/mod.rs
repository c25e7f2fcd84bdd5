//! Data models for observed activity, positions and markets.

mod activity;
mod market;
mod position;

pub use activity::{Activity, ActivityEvent, Side};
pub use market::{classify_market, market_window, normalize_slug, time_urgency, Asset};
pub use position::{CopierPosition, MarketPosition};
