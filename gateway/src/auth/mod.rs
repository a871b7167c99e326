//! Login interception and the token store backing session resumption.
pub mod interceptor;
pub mod tokens;

pub use interceptor::{AuthInterceptor, AuthState, PendingLogin, Route};
pub use tokens::{IssuedToken, TokenStore};
