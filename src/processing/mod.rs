pub mod analysis;
pub mod auto_bias;
pub mod result;
pub mod runner;
pub mod scheduler;
pub mod signal;
pub mod task_builder;
