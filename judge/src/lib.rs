pub mod api;
pub mod comparator;
pub mod compiler;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod judger;
pub mod languages;
pub mod queue;
pub mod redis_manager;
pub mod reporter;
pub mod sandbox;
pub mod storage;
