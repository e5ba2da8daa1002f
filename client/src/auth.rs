use std::sync::Arc;

use hivepost_shared::{User, UserId};
use parking_lot::Mutex;
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::gateway::{RemoteGateway, SessionEvent};

/// Process-wide session state.
///
/// Started once; follows the gateway's session events until [`shutdown`]
/// (or drop). Everything that needs the signed-in user reads it from here.
///
/// [`shutdown`]: AuthContext::shutdown
pub struct AuthContext {
    gateway: Arc<dyn RemoteGateway>,
    user: Arc<watch::Sender<Option<User>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl AuthContext {
    pub async fn start(gateway: Arc<dyn RemoteGateway>) -> Result<Self> {
        // Subscribe first so a change racing the initial query is not lost.
        let events = gateway.session_events();
        let initial = gateway.current_user().await?;
        debug!(user = ?initial.as_ref().map(|u| &u.username), "session restored");

        let user = Arc::new(watch::channel(initial).0);
        let listener = tokio::spawn(listen(gateway.clone(), events, user.clone()));

        Ok(Self {
            gateway,
            user,
            listener: Mutex::new(Some(listener)),
        })
    }

    pub fn current_user(&self) -> Option<User> {
        self.user.borrow().clone()
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user.borrow().as_ref().map(|u| u.id.clone())
    }

    pub fn is_signed_in(&self) -> bool {
        self.user.borrow().is_some()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<User>> {
        self.user.subscribe()
    }

    pub fn sign_in_url(&self, redirect: &str) -> String {
        self.gateway.sign_in_url(redirect)
    }

    pub async fn sign_in(&self, token: &str) -> Result<User> {
        let user = self.gateway.sign_in(token).await?;
        self.user.send_replace(Some(user.clone()));
        Ok(user)
    }

    pub async fn sign_out(&self) -> Result<()> {
        self.gateway.sign_out().await?;
        self.user.send_replace(None);
        Ok(())
    }

    /// Stops following session events. The last known user stays readable.
    pub fn shutdown(&self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
            debug!("auth listener stopped");
        }
    }
}

impl Drop for AuthContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn listen(
    gateway: Arc<dyn RemoteGateway>,
    mut events: broadcast::Receiver<SessionEvent>,
    user: Arc<watch::Sender<Option<User>>>,
) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::SignedIn(next)) => {
                info!(user = %next.username, "session started");
                user.send_replace(Some(next));
            }
            Ok(SessionEvent::SignedOut) => {
                info!("session ended");
                user.send_replace(None);
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "session events lagged, re-reading current user");
                match gateway.current_user().await {
                    Ok(current) => {
                        user.send_replace(current);
                    }
                    Err(e) => warn!(error = %e, "failed to re-read current user"),
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
