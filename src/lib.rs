pub mod broker;
pub mod client;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod protocol;
pub mod shutdown;
pub mod supervisor;
pub mod transport;
pub mod worker;
