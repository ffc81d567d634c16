pub mod gateway;
pub mod pool;
pub mod targets;
