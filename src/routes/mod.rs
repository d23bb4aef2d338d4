pub mod error;
pub mod health;
pub mod sheet;
pub mod upload;

pub use error::ApiError;
