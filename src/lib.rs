#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub(crate) mod api;
pub mod app;
pub mod artifact;
pub mod clients;
pub mod config;
pub mod feature_store;
pub mod frame;
pub mod model;
pub mod observability;
pub mod pipeline;
pub mod registry;
pub mod streaming;
pub mod util;
