//! Session context and page guard.
//!
//! `Session` is the explicit context handed to every component: it owns the
//! credential, the profile namespace and an epoch counter. Every credential
//! write bumps the epoch in the same step, which is what components compare
//! against to drop dependent caches and stale responses.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::credential::{decode_claims, Claims, Credential, CredentialStore};
use crate::error::{ClientError, Result};
use crate::models::Profile;
use crate::profile::{apply_edit, ProfileCache, ProfileEdit};
use crate::storage::LocalStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthSignal {
    /// State found at startup, no transition yet.
    Restored,
    LoggedIn,
    LoggedOut,
    /// A request came back 401; the credential is already gone.
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub epoch: u64,
    pub signal: AuthSignal,
    /// Subject of the current credential; selects the profile namespace.
    pub subject: Option<String>,
}

pub struct Session {
    credentials: CredentialStore,
    profiles: ProfileCache,
    state: watch::Sender<SessionSnapshot>,
}

impl Session {
    pub fn new(store: LocalStore) -> Arc<Self> {
        let credentials = CredentialStore::new(store.clone());
        let subject = credentials.get().map(|c| c.claims.sub);
        let (state, _) = watch::channel(SessionSnapshot {
            epoch: 0,
            signal: AuthSignal::Restored,
            subject,
        });
        Arc::new(Self {
            credentials,
            profiles: ProfileCache::new(store),
            state,
        })
    }

    pub fn credential(&self) -> Option<Credential> {
        self.credentials.get()
    }

    pub fn claims(&self) -> Option<Claims> {
        self.credential().map(|c| c.claims)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    pub fn epoch(&self) -> u64 {
        self.state.borrow().epoch
    }

    /// App-wide observation point for login/logout/expiry.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.subscribe()
    }

    /// Store a freshly issued token. Undecodable tokens are refused.
    pub fn establish(&self, token: &str) -> Result<Claims> {
        let claims = decode_claims(token).map_err(|e| ClientError::LocalDecode(e.to_string()))?;
        self.credentials.set(token)?;
        self.transition(AuthSignal::LoggedIn, Some(claims.sub.clone()));
        tracing::info!(subject = %claims.sub, "session established");
        Ok(claims)
    }

    pub fn logout(&self) {
        self.end(AuthSignal::LoggedOut);
        tracing::info!("logged out");
    }

    /// 401 handling. Only the token that was actually rejected is cleared, so
    /// a late 401 for an old session cannot log out a newer one.
    pub fn expire_if_current(&self, rejected_token: &str) -> bool {
        match self.credentials.get() {
            Some(current) if current.token != rejected_token => {
                tracing::debug!("ignoring 401 for a superseded credential");
                false
            }
            _ => {
                self.end(AuthSignal::Expired);
                tracing::warn!("credential rejected by server, session cleared");
                true
            }
        }
    }

    fn end(&self, signal: AuthSignal) {
        if let Err(e) = self.credentials.clear() {
            tracing::error!(error = %e, "failed to clear stored credential");
        }
        self.transition(signal, None);
    }

    fn transition(&self, signal: AuthSignal, subject: Option<String>) {
        self.state.send_modify(|s| {
            s.epoch += 1;
            s.signal = signal;
            s.subject = subject;
        });
    }

    /// Profile for the current namespace.
    pub fn profile(&self) -> Profile {
        let snap = self.snapshot();
        self.profiles.load(snap.subject.as_deref())
    }

    pub fn save_profile(&self, edit: ProfileEdit) -> Result<Profile> {
        let snap = self.snapshot();
        let updated = apply_edit(self.profiles.load(snap.subject.as_deref()), edit)?;
        self.profiles.save(snap.subject.as_deref(), &updated)?;
        Ok(updated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Page {
    Login,
    Register,
    /// Anonymous ad-hoc analysis, no session needed.
    Analyze,
    Home,
    Admin,
}

impl Page {
    pub fn requires_session(&self) -> bool {
        matches!(self, Page::Home | Page::Admin)
    }
}

/// Where the caller should navigate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Login,
    Home,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardState {
    Unknown,
    Checking,
    Authenticated(Claims),
    Unauthenticated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    /// Continue initialising the page.
    Proceed(Option<Claims>),
    /// Stop here: navigate and do nothing else.
    Redirect(Route),
}

/// Decides, once per page load, whether the page may initialise.
pub struct SessionGuard {
    session: Arc<Session>,
    page: Page,
    state: Mutex<GuardState>,
    checked_epoch: Mutex<u64>,
}

impl SessionGuard {
    pub fn new(session: Arc<Session>, page: Page) -> Self {
        Self {
            session,
            page,
            state: Mutex::new(GuardState::Unknown),
            checked_epoch: Mutex::new(0),
        }
    }

    pub fn page(&self) -> Page {
        self.page
    }

    pub fn state(&self) -> GuardState {
        self.state.lock().clone()
    }

    pub fn check(&self) -> GuardDecision {
        *self.state.lock() = GuardState::Checking;
        let snapshot_epoch = self.session.epoch();
        let claims = self.session.claims();
        *self.checked_epoch.lock() = snapshot_epoch;

        *self.state.lock() = match &claims {
            Some(c) => GuardState::Authenticated(c.clone()),
            None => GuardState::Unauthenticated,
        };

        let decision = match (self.page, claims) {
            // Already signed in: skip the auth forms
            (Page::Login | Page::Register, Some(_)) => GuardDecision::Redirect(Route::Home),
            (Page::Login | Page::Register | Page::Analyze, claims) => GuardDecision::Proceed(claims),
            (Page::Home | Page::Admin, None) => GuardDecision::Redirect(Route::Login),
            // Advisory only: the server re-checks every admin call
            (Page::Admin, Some(c)) if !c.is_admin => GuardDecision::Redirect(Route::Home),
            (Page::Home | Page::Admin, Some(c)) => GuardDecision::Proceed(Some(c)),
        };
        tracing::debug!(page = ?self.page, ?decision, "session guard");
        decision
    }

    /// Same transition logic, re-entered from any component that got an
    /// auth-related error back. `None` means stay and show the error inline.
    pub fn on_error(&self, err: &ClientError) -> Option<Route> {
        match err {
            ClientError::AuthExpired => {
                *self.state.lock() = GuardState::Unauthenticated;
                Some(Route::Login)
            }
            ClientError::PermissionDenied if self.page == Page::Admin => Some(Route::Home),
            _ => None,
        }
    }

    /// Redirect owed because the session expired somewhere since `check`.
    pub fn pending_redirect(&self) -> Option<Route> {
        let snap = self.session.snapshot();
        if snap.epoch != *self.checked_epoch.lock() && snap.signal == AuthSignal::Expired {
            *self.state.lock() = GuardState::Unauthenticated;
            if self.page.requires_session() {
                return Some(Route::Login);
            }
        }
        None
    }
}
