pub mod config;
pub mod db;
pub mod error;
pub mod fetcher;
pub mod loader;
pub mod scheduler;
pub mod secrets;
pub mod transform;
