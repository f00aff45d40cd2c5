// waypoint-cli: command line access to a Waypoint registry

pub mod cli;
pub mod commands;
pub mod logging;
pub mod settings;

pub use cli::{Cli, Command};
