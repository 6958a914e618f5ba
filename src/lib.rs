// src/lib.rs — Library root for promptloop

pub mod api;
pub mod cache;
pub mod cli;
pub mod evaluator;
pub mod infra;
pub mod pipeline;
pub mod provider;
pub mod store;
pub mod util;
