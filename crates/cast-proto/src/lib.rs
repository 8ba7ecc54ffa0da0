pub mod config;
pub mod frame;
pub mod pacer;
pub mod wire;
