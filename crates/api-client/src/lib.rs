pub mod client;
pub mod error;
pub mod types;

pub use client::{ApiClient, DeliveryAck};
pub use error::ApiError;
