//! Per-monitor health evaluation.

mod locks;
mod machine;
mod tracker;

pub use locks::*;
pub use machine::*;
pub use tracker::*;
