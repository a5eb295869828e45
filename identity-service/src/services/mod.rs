//! Services layer for the identity core.
//!
//! Business logic for authentication, sessions, second factor, user
//! administration and the two-person approval workflow. Persistence sits
//! behind the [`Store`] trait.

mod approvals;
mod audit;
mod auth;
mod database;
pub mod error;
mod jwt;
mod memory;
pub mod provisioning;
mod sessions;
pub mod store;
mod two_factor;
mod users;

pub use approvals::{ApprovalWorkflow, DecisionOutcome};
pub use audit::AuditSink;
pub use auth::{
    AuthEngine, AuthSession, AuthenticatedUser, ClientInfo, LoginAttempt, LoginOutcome,
    SecondFactorAttempt,
};
pub use database::PgStore;
pub use error::ServiceError;
pub use jwt::{AccessClaims, ChallengeClaims, IssuedToken, TokenService};
pub use memory::MemoryStore;
pub use provisioning::{DisabledProvisioning, HttpProvisioningClient, ProvisioningClient};
pub use sessions::{NewSession, SessionRegistry};
pub use store::{Store, StoreError, StoreResult, UserChange, UserChangeApplied};
pub use two_factor::{verify_totp, TwoFactorService, TwoFactorSetup, RECOVERY_CODE_COUNT};
pub use users::{AdminActionOutcome, NewUser, ProfileChanges, UserAdmin};
