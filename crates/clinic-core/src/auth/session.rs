//! Session teardown and navigation out of the authenticated area.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use super::CredentialStore;

/// Moves the application to another route. The UI layer owns what that means.
pub trait Navigator: Send + Sync {
    fn navigate(&self, route: &str);
}

/// Publishes the current route on a watch channel.
pub struct WatchNavigator {
    tx: watch::Sender<String>,
}

impl WatchNavigator {
    pub fn new(initial_route: impl Into<String>) -> Self {
        let (tx, _rx) = watch::channel(initial_route.into());
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> String {
        self.tx.borrow().clone()
    }
}

impl Navigator for WatchNavigator {
    fn navigate(&self, route: &str) {
        debug!(route, "Navigating");
        self.tx.send_replace(route.to_string());
    }
}

/// Clears the credential store, then sends the user to the login route.
pub struct SessionTerminator {
    store: Arc<CredentialStore>,
    navigator: Arc<dyn Navigator>,
    login_route: String,
}

impl SessionTerminator {
    pub fn new(
        store: Arc<CredentialStore>,
        navigator: Arc<dyn Navigator>,
        login_route: impl Into<String>,
    ) -> Self {
        Self {
            store,
            navigator,
            login_route: login_route.into(),
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// End the session. The store is empty before the navigator is called.
    /// Returns false (and does nothing) when there was no session to end.
    pub fn terminate(&self) -> bool {
        if !self.store.clear() {
            debug!("No session to terminate");
            return false;
        }
        warn!(route = %self.login_route, "Session terminated");
        self.navigator.navigate(&self.login_route);
        true
    }
}
