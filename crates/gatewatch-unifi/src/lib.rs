//! Gatewatch controller client
//!
//! HTTP client for the upstream UniFi controller. Two API flavours
//! (classic and integration) and two auth modes: a static API key on
//! UniFi OS gateways, cookie + CSRF login on legacy self-hosted
//! controllers. Feeds the name-resolution maps and WAN metadata through a
//! background polling loop.

pub mod client;
pub mod firewall;
pub mod network;
pub mod poll;

use thiserror::Error;

pub use client::{ControllerType, Features, TestOutcome, UnifiClient, UnifiSettings};
pub use network::{NetworkConfig, VpnNetwork, WanInterface};

#[derive(Error, Debug)]
pub enum UnifiError {
    /// 401/403 from the integration API, with an operator-readable hint.
    #[error("{message}")]
    Permission { status: u16, message: String },

    #[error("Integration API not available on legacy controllers")]
    NotSupportedOnLegacy,

    #[error("Controller is not configured")]
    NotConfigured,

    #[error("Site '{0}' not found on this controller")]
    SiteNotFound(String),

    #[error("Controller returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid controller response: {0}")]
    InvalidResponse(String),
}

pub type UnifiResult<T> = Result<T, UnifiError>;

impl UnifiError {
    /// Status code this error should surface as at the API boundary:
    /// 401/403/422 pass through with hints, anything else is a 502.
    pub fn api_status(&self) -> u16 {
        match self {
            UnifiError::Permission { status, .. } => *status,
            UnifiError::Status { status, .. } if matches!(status, 401 | 403 | 422) => *status,
            UnifiError::NotSupportedOnLegacy | UnifiError::NotConfigured => 400,
            _ => 502,
        }
    }
}
