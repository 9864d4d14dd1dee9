use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Signed-in session held explicitly on AppState. Created by
/// auth.signIn, dropped by auth.signOut; there is no ambient auth state
/// anywhere else.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub user: User,
    pub signed_in_at: String,
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    pub user_type: String,
    pub school_id: String,
    pub address: Option<String>,
    pub phone: Option<String>,
}

pub const USER_TYPE_ADMIN: &str = "admin";
pub const USER_TYPE_TEACHER: &str = "teacher";

pub fn is_valid_user_type(user_type: &str) -> bool {
    user_type == USER_TYPE_ADMIN || user_type == USER_TYPE_TEACHER
}

/// Salted SHA-256 digest stored as "salt$hex".
pub fn hash_password(password: &str) -> String {
    let salt = Uuid::new_v4().simple().to_string();
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    format!("{}${:x}", salt, hasher.finalize())
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt, digest)) = stored.split_once('$') else {
        return false;
    };
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize()) == digest
}

pub fn new_token() -> String {
    Uuid::new_v4().to_string()
}
