pub mod config;
pub mod models;
pub mod presets;
pub mod providers;
