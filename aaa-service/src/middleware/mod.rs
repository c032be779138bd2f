pub mod auth;
pub mod service_auth;

pub use auth::{AuthContext, CurrentUser, auth_middleware};
pub use service_auth::ServiceCaller;
