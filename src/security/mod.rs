pub mod auth;
pub mod callback;
pub mod jwt;
pub mod token_cache;
