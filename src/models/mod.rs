pub mod job;
pub mod sheet;
