//! Control-plane request signing and the wake/query/kill client (§6, §4.8).

mod client;
mod signing;

pub use client::{
    ClusterService, ControlError, ControlPlaneClient, KillResponse, QueryResponse, WakeResponse,
};
pub use signing::{decode_secret, default_tolerance_secs, sign_request, verify_request, SigningError};
