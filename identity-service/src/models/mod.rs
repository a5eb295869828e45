//! Domain models for the identity core.

pub mod approval;
pub mod audit;
pub mod authority;
pub mod device;
pub mod session;
pub mod user;

pub use approval::{ApprovalAction, ApprovalRequest, ApprovalResponse, ApprovalStatus, Decision};
pub use audit::{AuditAction, AuditLogEntry};
pub use authority::{effective_permissions, is_valid_permission, permissions, AuthorityLevel};
pub use device::{DeviceInfo, RememberedDevice};
pub use session::{Session, SessionInfo};
pub use user::{Suspension, User, UserProfile};
