//! Ephemeral file-transfer service.
//!
//! Senders upload straight to the object store with short-lived grants;
//! recipients list, download or zip a transfer through this service, which
//! enforces the optional transfer password on every read path.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod orchestrator;
pub mod routes;
pub mod services;
pub mod state;
