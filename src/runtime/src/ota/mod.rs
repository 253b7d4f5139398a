//! OTA server access: the credentials package and OAuth2 token exchange.

pub mod auth;
pub mod credentials;

pub use auth::fetch_access_token;
pub use credentials::ServerCredentials;
