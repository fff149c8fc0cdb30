//! Database module.
//!
//! SQLite storage for monitors, pings, incidents, maintenance events and the
//! persisted health-tracker state, with embedded migrations.

mod events;
mod incidents;
mod models;
mod store;

pub use incidents::NewIncident;
pub use models::*;
pub use store::*;
