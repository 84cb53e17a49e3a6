pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod video_client;

pub use config::Config;
pub use errors::ApiError;
