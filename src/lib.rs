pub mod agent;
pub mod client;
pub mod config;
pub mod directory;
pub mod model;
pub mod net;
pub mod resolver;
pub mod service;
pub mod task;
pub mod wire;

pub use anyhow::{anyhow as err, bail, Error, Result};

pub use crate::client::Client;
pub use crate::config::Config;
pub use crate::resolver::Resolver;
pub use crate::wire::Message;
