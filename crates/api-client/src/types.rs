//! Request/response types for the remote authority's session API.
//!
//! Request bodies are built at enqueue time and travel through the durable
//! queue as JSON, so only the response shapes are typed here.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

/// Acknowledgment of a create-session mutation. `id` is the remote-assigned
/// session identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub id: String,
}
