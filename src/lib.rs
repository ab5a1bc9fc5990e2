pub mod api;
pub mod clients;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod models;
pub mod status;
pub mod utils;
pub mod worker;
