//! Trackgate - authorizing gateway for experiment tracking servers
//!
//! This library provides the core functionality of the gateway.
//! It exposes all modules for testing purposes.

pub mod authz;
pub mod entities;
pub mod errors;
pub mod settings;
pub mod storage;
pub mod tracking;
pub mod upstream;
pub mod web;
