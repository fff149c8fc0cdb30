//! Incident lifecycle management.

mod events;
mod manager;

pub use events::*;
pub use manager::*;
