#![forbid(unsafe_code)]

pub mod api;
pub mod app;
pub mod auth;
pub mod authorization;
pub mod bouncer;
pub mod config;
pub mod constants;
pub mod docker_proxy;
pub mod error;
pub mod management;
pub mod models;
pub mod observability;
pub mod proxy;
pub mod registry_auth;
pub mod response_filter;
pub mod runtime;
pub mod stacks;
pub mod storage;
pub mod transport;
