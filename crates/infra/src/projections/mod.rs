//! Read models built from published inventory events.

pub mod stock_view;

pub use stock_view::{spawn_stock_view_worker, SequenceGap, StockSnapshot, StockView, DEFAULT_GAP_CAPACITY};
