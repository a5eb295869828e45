pub mod auth;
pub mod client;

pub use auth::{auth_middleware, bearer_token, AuthUser};
pub use client::ClientContext;
