//! Cloud API module.
//!
//! Provides the HTTP client for the Lattice Cloud API and the endpoint
//! configuration it is pointed at.

mod client;
pub mod config;

pub use client::{
    ApiClient, CLIENT_ID, DEVICE_SCOPE, DeviceCodeResponse, DeviceTokenOutcome, HeartbeatRequest,
    RefreshResponse, RevokeRequest, TokenGrant, TokenValidation, TokenVerifyResult, UserProfile,
};
pub use config::{CloudEndpointConfig, ConfigSource, load_cloud_config};
