pub mod audit;
pub mod auth;
pub mod config;
pub mod db;
pub mod document;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod inference;
pub mod models;
pub mod normalize;
pub mod prompt;
pub mod quota;
pub mod storage;

#[cfg(test)]
mod testing;
