// gateway/src/lib.rs
pub mod apps;
pub mod auth;
pub mod backend;
pub mod deployer_api;
pub mod proxy;
pub mod static_files;
pub mod utils;
