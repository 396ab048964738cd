#![allow(clippy::uninlined_format_args)]

pub mod app;
pub mod appender;
pub mod cache;
pub mod config;
pub mod embed;
pub mod feed;
pub mod links;
pub mod log;
pub mod media;
pub mod render;
pub mod storage;
pub mod viewer;
pub mod widget;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::run;
