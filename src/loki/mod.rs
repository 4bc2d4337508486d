pub mod auth;
pub mod client;
pub mod types;
pub mod url;
