pub mod cancel;
pub mod cli;
pub mod compare;
pub mod config;
pub mod diff;
pub mod error;
pub mod merge;
pub mod model;
pub mod paths;
pub mod report;
pub mod retention;
pub mod store;
pub mod transport;
pub mod trend;
