pub mod cache;
pub mod client;
pub mod constants;
pub mod db;
pub mod extractor;
pub mod generator;
pub mod hardening;
pub mod health;
pub mod ingress;
pub mod logging;
pub mod main_helper;
pub mod protocol;
pub mod search;
pub mod types;
pub mod visibility;

pub use types::*;

pub use main_helper::{AppState, Args};
