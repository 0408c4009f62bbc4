pub mod cli;
pub mod daemon;
pub mod load_config;
pub mod logging;
pub mod upload;

pub use cli::{run, Cli, Commands};
