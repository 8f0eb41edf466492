//! Distributed crawl orchestration: spiders schedule and dispatch requests over
//! a message bus, agents download them and the responses flow back through a
//! data-flow pipeline.

pub mod agent;
pub mod agent_center;
pub mod bus;
pub mod cli;
pub mod crawler;
pub mod dataflow;
pub mod downloader;
pub mod error;
pub mod scheduler;
pub mod statistics;
pub mod supplier;
pub mod utils;

pub use error::{Result, SpiderError};
