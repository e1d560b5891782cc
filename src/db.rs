pub mod loader;
pub mod memory;
pub mod partition;
pub mod postgres;
pub mod sql;
pub mod store;
pub mod table;
