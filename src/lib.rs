pub mod bridge;
pub mod codec;
pub mod ppp;
pub mod qproxy;
pub mod server;
pub mod utils;
pub mod vnet;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;
