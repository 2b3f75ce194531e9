pub mod config;
pub mod dosbox;
pub mod server;
pub mod uplink;
