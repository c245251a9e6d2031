pub mod cli;
pub mod config;
pub mod fetch;
pub mod server;
pub mod state;
pub mod storage;
