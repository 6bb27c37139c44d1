//! Windowing for the grouping engine
//!
//! Measurements are aggregated in tumbling windows: fixed-size,
//! non-overlapping, epoch-aligned intervals. Each measurement belongs to
//! exactly one window.
//!
//! ```text
//! Time:     0----5----10---15---20---25---30
//! Windows:  [----][----][----][----][----]
//! ```
//!
//! Windows are half-open (`[start, end)`); sealing is driven by the
//! watermark passing `end`, see [`crate::grouping`].

pub mod assigner;
pub mod types;

pub use assigner::{TumblingWindowAssigner, WindowAssigner};
pub use types::WindowBounds;
