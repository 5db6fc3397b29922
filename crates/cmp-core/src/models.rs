//! Domain models for the certificate life-cycle engine.
//!
//! These are the core types shared across all crates.

pub mod adapter;
pub mod agent;
pub mod approval;
pub mod audit;
pub mod certificate;
pub mod installation;
pub mod issuance;
pub mod scan;
