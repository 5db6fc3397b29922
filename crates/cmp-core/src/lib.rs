//! Core types for the certificate life-cycle engine: domain models,
//! repository traits, error types, the audit-chain hash construction and
//! the collaborator interfaces (principal/policy, metrics) injected into
//! every component.

pub mod chain;
pub mod error;
pub mod metrics;
pub mod models;
pub mod principal;
pub mod repository;
