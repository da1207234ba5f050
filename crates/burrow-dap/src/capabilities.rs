//! Resolved adapter capabilities.

use crate::protocol::Capabilities;

/// Capabilities negotiated during `initialize`, stored as plain booleans.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DapCapabilities {
    /// Whether the adapter expects a `configurationDone` request after the
    /// `initialized` event.
    pub supports_configuration_done_request: bool,
    /// Whether the adapter supports conditional breakpoints.
    pub supports_conditional_breakpoints: bool,
    /// Whether the adapter supports `evaluate` for hovers.
    pub supports_evaluate_for_hovers: bool,
    /// Whether the adapter supports the `terminate` request.
    pub supports_terminate_request: bool,
}

impl DapCapabilities {
    /// Resolve the optional flags of the `initialize` response body.
    pub fn from_initialize_response(caps: &Capabilities) -> Self {
        Self {
            supports_configuration_done_request: caps
                .supports_configuration_done_request
                .unwrap_or(false),
            supports_conditional_breakpoints: caps
                .supports_conditional_breakpoints
                .unwrap_or(false),
            supports_evaluate_for_hovers: caps.supports_evaluate_for_hovers.unwrap_or(false),
            supports_terminate_request: caps.supports_terminate_request.unwrap_or(false),
        }
    }
}
