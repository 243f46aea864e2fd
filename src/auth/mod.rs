//! Connection authentication: a single shared bearer key (`AUTH_KEY`),
//! compared in constant time.

pub mod api_secret;

pub use api_secret::{authorize, bearer_token};
