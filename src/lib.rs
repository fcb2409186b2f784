pub mod backend;
pub mod config;
pub mod controller;
pub mod notice;
pub mod session;
pub mod todo;
pub mod utils;
