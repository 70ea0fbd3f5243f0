//! Crowdsourced parking spot tracking: lifecycle, merging and arrival
//! detection for reported spots.

pub mod arrival;
pub mod clock;
pub mod config;
pub mod driver;
pub mod error;
pub mod geo;
pub mod lifecycle;
pub mod models;
pub mod notify;
pub mod persistence;
pub mod reconcile;
pub mod remote;
pub mod session;
pub mod store;
pub mod ticker;
pub mod undo;

pub use config::Config;
pub use driver::{Collaborators, Driver, UserAction};
pub use error::SpotError;
pub use lifecycle::{evaluate, Evaluation, SpotStatus};
pub use models::{Coordinates, NewSpot, SpotRecord};
pub use session::Session;
