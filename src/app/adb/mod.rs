pub mod channel;
pub mod locator;
pub mod paths;
pub mod runner;
