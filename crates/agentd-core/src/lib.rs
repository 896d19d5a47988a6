pub mod agent;
pub mod coordinator;
pub mod execution;
pub mod models;
pub mod persistence;
pub mod registry;
pub mod report;
pub mod task;
pub mod task_context;
