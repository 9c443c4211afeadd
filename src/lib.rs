pub mod auth;
pub mod config;
pub mod generator;
pub mod library;
pub mod model;
pub mod pipeline;
pub mod store;
pub mod studio;
