pub mod api;
pub mod bot;
pub mod channels;
pub mod config;
pub mod jobs;
pub mod shared;
pub mod store;
pub mod webhooks;
