//! API Route Handlers

pub mod health;
pub mod load;
pub mod pre_aggregations;
pub mod queue;
