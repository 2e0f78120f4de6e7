pub mod api;
pub mod broker;
pub mod browser;
pub mod config;
pub mod job;
pub mod locate;
pub mod protocol;
pub mod session;
pub mod shutdown;
