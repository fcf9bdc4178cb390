pub mod config;
pub mod experiments;
pub mod lm;
pub mod session;
