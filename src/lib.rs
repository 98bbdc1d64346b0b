pub mod admin;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gate;
pub mod jsonrpc;
pub mod middleware;
pub mod models;
pub mod proxy;
pub mod services;
pub mod utils;
