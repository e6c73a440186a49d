pub mod config;
pub mod error;
pub mod structs;

pub mod pool;
pub mod ring;
pub mod scheduler;
pub mod wheel;

pub mod nat;
pub mod stats;
pub mod template;
pub mod worker;
