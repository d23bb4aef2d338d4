pub mod descriptor;
pub mod engine;
pub mod pipeline;
pub mod runner;
pub mod storage;
pub mod validation;
