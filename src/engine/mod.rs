pub mod completion;
pub mod control;
pub mod executor;
pub mod history;
pub mod jobs;
pub mod multiwatch;
pub mod parser;
pub mod process;
pub mod safety;
