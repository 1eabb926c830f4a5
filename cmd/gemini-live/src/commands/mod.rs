//! CLI commands module.

mod chat;
mod config;
mod util;

pub use chat::ChatCommand;
pub use config::ConfigCommand;

pub(crate) use util::*;
