pub mod config;
pub mod error;
pub mod handler;
pub mod models;
pub mod protocol;
pub mod proxy;

pub use error::{Error, Result};
