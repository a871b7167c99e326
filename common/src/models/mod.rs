// common/src/models/mod.rs
pub mod bundle;
pub mod changes;
pub mod credentials;

pub use bundle::{BundleSpec, ServiceSpec, MAX_UNITS_PER_SERVICE};
pub use changes::Change;
pub use credentials::Credentials;
