//! Authentication state: credentials, their persisted slots, and session teardown.
//!
//! This module provides:
//! - `CredentialStore`: the current credential, single-flight token refresh
//! - `KeyValueStore` backends: JSON file, OS keychain, memory
//! - `SessionTerminator`: clears the store and navigates to the login route
//!
//! Sessions survive restarts through the persisted slots and end on logout or
//! when a token refresh fails.

pub mod credentials;
pub mod session;
pub mod storage;

pub use credentials::{
    Credential, CredentialStore, RefreshError, RefreshHandle, SessionUser, TokenRefresher,
};
pub use session::{Navigator, SessionTerminator, WatchNavigator};
pub use storage::{FileStorage, KeyValueStore, KeyringStorage, MemoryStorage};
