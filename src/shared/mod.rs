pub mod models;
pub mod notify;
pub mod state;
pub mod utils;
