pub mod config;
pub mod invalidation;
pub mod models;
pub mod services;
pub mod session;
pub mod startup;
pub mod store;
