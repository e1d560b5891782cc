pub mod config;
pub mod dataset;
pub mod db;
pub mod error;
pub mod extract;
pub mod pipeline;
pub mod utils;
