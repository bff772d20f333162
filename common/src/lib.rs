pub mod aggregate;
pub mod assignment;
pub mod config;
pub mod plot;
pub mod progress;
pub mod remote;
pub mod run;
pub mod runner;
pub mod source;
pub mod ssh;
