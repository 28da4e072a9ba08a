#[macro_use]
extern crate log;

pub mod cgroup;
pub mod config;
pub mod error;
pub mod flash;
pub mod net;
pub mod users;
