//! Run many long-lived WhatsApp account connections from one process.
//!
//! [`manager::InstanceManager`] owns every instance; each instance is driven
//! by its own [`controller::ConnectionController`] task, which applies the
//! reconnect backoff, rate limits, health probing and heartbeat cadence in
//! [`protection`] and [`heartbeat`].

pub mod backup;
pub mod channels;
pub mod config;
pub mod controller;
pub mod cp;
pub mod db;
pub mod engines;
pub mod error;
pub mod heartbeat;
pub mod instance;
pub mod manager;
pub mod observability;
pub mod protection;

pub use config::Config;
pub use error::{ManagerError, ManagerResult};
pub use manager::{Collaborators, InstanceManager};
