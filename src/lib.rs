pub mod broadcast;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod resolver;
pub mod server;
pub mod service;
pub mod session;
pub mod terminal;
