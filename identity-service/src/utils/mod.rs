pub mod password;
pub mod token;
pub mod validation;

pub use password::{hash_password, verify_password, Password, PasswordHashString};
pub use token::{generate_recovery_code, hash_token, normalize_recovery_code};
pub use validation::{normalize_email, validate_display_name, validate_password_strength, ValidatedJson};
