pub mod download;
pub mod retry;
