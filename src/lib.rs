pub mod config;
pub mod error;
pub mod filters;
pub mod indexer;
pub mod logger;
pub mod models;
pub mod proxy;
pub mod rag;
pub mod server;
pub mod session;
