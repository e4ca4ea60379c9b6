pub mod cert;
pub mod config;
pub mod controller;
pub mod diff;
pub mod domain;
pub mod limiter;
pub mod panel;
pub mod relay;
pub mod rules;
pub mod service;
pub mod status;
pub mod tag;
pub mod version;
pub mod xray;

#[cfg(test)]
mod testing;
