pub mod config;
pub mod quota;
pub mod resource;
pub mod validate;
