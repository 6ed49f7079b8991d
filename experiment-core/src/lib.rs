pub mod bus;
pub mod config;
pub mod db;
pub mod entity;
pub mod error;
pub mod observability;
pub mod rpc;
pub mod test_helpers;
pub mod utils;
