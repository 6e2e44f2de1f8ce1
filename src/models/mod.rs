//! Core data models for the transfer service.
//!
//! `transfer` holds the per-transfer identity and metadata document, and
//! the client-facing file descriptor derived on every listing. `object`
//! describes a stored blob as reported by the object store gateway.

pub mod object;
pub mod transfer;
