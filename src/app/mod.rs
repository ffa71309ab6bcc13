pub mod adb;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod exchange;
pub mod history;
pub mod logging;
pub mod models;
pub mod registry;
pub mod scheduler;
pub mod storage;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;
