//! Session lifecycle
//!
//! Tracks the group session, its roster, and the events reported to the app.

mod events;
mod participants;
mod state;

pub use events::*;
pub use participants::*;
pub use state::*;
