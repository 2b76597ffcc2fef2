pub mod cli;
pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod log;
pub mod manager;
pub mod paths;
pub mod record;
pub mod scanner;
pub mod store;
pub mod supervisor;
pub mod sys;
pub mod watch;
