pub mod chain;
pub mod classifier;
pub mod orchestrator;
pub mod parse;
pub mod pipeline;
pub mod prompt;
