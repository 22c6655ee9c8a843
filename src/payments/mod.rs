pub mod error;
pub mod factory;
pub mod health;
pub mod provider;
pub mod providers;
pub mod rc;
pub mod types;
pub mod utils;
