pub mod args;
pub mod commands;

pub use args::{Args, CacheAction, Command};
