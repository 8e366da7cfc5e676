//! Authentication for Lattice agents.
//!
//! Provides OAuth 2.0 device flow authentication, access-token refresh
//! with rotation, and the session facade used by command handlers.

mod device_flow;
mod refresh;
mod session;

pub use device_flow::{DeviceAuthorization, DeviceFlow, FlowState};
pub use refresh::TokenRefreshCoordinator;
pub use session::{AuthStatus, SessionManager};
