pub mod credentials;
pub mod manager;

pub use credentials::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use manager::{Session, SessionManager, SessionState};
