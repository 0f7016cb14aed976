#![allow(dead_code)]

pub mod builders;
pub mod db;

pub use builders::{
    request, GatewayBuilder, UnavailableStore, CREATED_EXPERIMENT_ID, TAKEN_EXPERIMENT_NAME,
};
