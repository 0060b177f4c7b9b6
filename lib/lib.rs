pub mod bitfield;
pub mod build_info;
pub mod cli;
pub mod config;
pub mod feed;
pub mod index;
pub mod logging;
pub mod server;
pub mod state;
pub mod store;
