pub mod api;
pub mod app;
pub mod config;
pub mod error;
pub mod notify;
pub mod store;
pub mod util;
