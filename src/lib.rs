#[macro_use]
extern crate tracing;

pub mod alerting;
pub mod errors;
pub mod executor;
pub mod indexer;
pub mod io_models;
pub mod object_handlers;
pub mod rate_limiter;
pub mod rest_mapper;
pub mod runner;
pub mod template;
pub mod wait;
