// =============================================================================
// HTTP/WS boundary for the Helios control plane
// =============================================================================

pub mod error;
pub mod rest;
pub mod stream;
pub mod ws;
