pub mod auth;
pub mod config;
pub mod embeddings;
pub mod inference;
pub mod manager;
