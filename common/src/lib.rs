pub mod api_client;
pub mod backend;
pub mod config;
pub mod error;
pub mod messages;
pub mod models;
pub mod utils;

pub use api_client::ApiClient;
pub use backend::{Backend, BackendLink};
pub use self::config::*;
pub use error::*;
pub use messages::*;
pub use models::{BundleSpec, Change, Credentials, MAX_UNITS_PER_SERVICE};
pub use utils::*;
