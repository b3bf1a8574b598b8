pub mod auth;
pub mod responses;
pub mod router;
pub mod state;
pub mod storage;
pub mod uploads;

pub use auth::{AuthUser, require_user};
pub use responses::{ApiError, ApiMessage, internal_error, json_error};
pub use state::AppState;
