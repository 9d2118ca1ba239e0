//! Composition root: one `AppSession` per page load.
//!
//! Every component receives the same `Session` context at construction.
//! `init` runs the guard first and only touches the network when the guard
//! lets the page proceed.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::Deserialize;
use serde_json::json;

use crate::admin::AdminPanel;
use crate::analyze::AdHocAnalyzer;
use crate::clusters::ClusterCatalog;
use crate::config::ClientConfig;
use crate::credential::Claims;
use crate::error::{ClientError, Result};
use crate::http::{ApiRequest, HttpClient, ReqwestTransport, Transport};
use crate::models::SessionInfo;
use crate::session::{GuardDecision, Page, Route, Session, SessionGuard};
use crate::storage::LocalStore;
use crate::workflow::ScanWorkflow;

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

/// What `/api/app/me` last said, valid only for the epoch it was fetched in.
#[derive(Default)]
struct SessionView {
    epoch: u64,
    info: Option<SessionInfo>,
    status: String,
}

impl SessionView {
    fn fresh(epoch: u64) -> Self {
        Self {
            epoch,
            ..Default::default()
        }
    }
}

pub struct AppSession {
    config: ClientConfig,
    session: Arc<Session>,
    http: HttpClient,
    pub guard: SessionGuard,
    pub catalog: ClusterCatalog,
    pub workflow: ScanWorkflow,
    pub admin: AdminPanel,
    pub analyzer: AdHocAnalyzer,
    view: Mutex<SessionView>,
}

impl AppSession {
    /// Open the local store under the configured data directory and talk to
    /// the configured backend over HTTP.
    pub fn open(config: ClientConfig, page: Page) -> Result<Self> {
        let store = LocalStore::open(&config.data_dir)?;
        let transport = Arc::new(ReqwestTransport::new(config.base_url.clone()));
        Ok(Self::with_transport(config, store, transport, page))
    }

    pub fn with_transport(config: ClientConfig, store: LocalStore, transport: Arc<dyn Transport>, page: Page) -> Self {
        let session = Session::new(store);
        let http = HttpClient::new(transport, session.clone());
        Self {
            guard: SessionGuard::new(session.clone(), page),
            catalog: ClusterCatalog::new(http.clone()),
            workflow: ScanWorkflow::new(http.clone(), config.report_lines),
            admin: AdminPanel::new(http.clone(), config.admin_limit),
            analyzer: AdHocAnalyzer::new(http.clone()),
            view: Mutex::new(SessionView::fresh(session.epoch())),
            config,
            session,
            http,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        self.view().info.clone()
    }

    pub fn status(&self) -> String {
        self.view().status.clone()
    }

    /// Locks the view, dropping it first if the credential changed since.
    fn view(&self) -> MutexGuard<'_, SessionView> {
        let epoch = self.session.epoch();
        let mut view = self.view.lock();
        if view.epoch != epoch {
            *view = SessionView::fresh(epoch);
        }
        view
    }

    /// Page load. A redirect means nothing else ran.
    pub async fn init(&self) -> Result<GuardDecision> {
        let decision = self.guard.check();
        if !matches!(decision, GuardDecision::Proceed(_)) {
            return Ok(decision);
        }

        match self.guard.page() {
            Page::Home => self.init_home().await,
            Page::Admin => self.init_admin().await,
            Page::Login | Page::Register | Page::Analyze => Ok(decision),
        }
    }

    async fn init_home(&self) -> Result<GuardDecision> {
        if let Err(e) = self.load_me().await {
            return self.redirect_or(e);
        }
        let clusters = match self.catalog.load().await {
            Ok(c) => c,
            Err(e) => return self.redirect_or(e),
        };
        if self.workflow.cluster_id().is_none() {
            if let Some(first) = clusters.first() {
                if let Err(e) = self.workflow.select_cluster(&first.id).await {
                    // history errors stay on the scan panel
                    if let Some(route) = self.guard.on_error(&e) {
                        return Ok(GuardDecision::Redirect(route));
                    }
                }
            }
        }
        Ok(GuardDecision::Proceed(self.session.claims()))
    }

    async fn init_admin(&self) -> Result<GuardDecision> {
        let (users, orgs) = tokio::join!(self.admin.load_users(), self.admin.load_orgs());
        for res in [users.err(), orgs.err()].into_iter().flatten() {
            if let Some(route) = self.guard.on_error(&res) {
                return Ok(GuardDecision::Redirect(route));
            }
        }
        Ok(GuardDecision::Proceed(self.session.claims()))
    }

    fn redirect_or(&self, err: ClientError) -> Result<GuardDecision> {
        match self.guard.on_error(&err) {
            Some(route) => Ok(GuardDecision::Redirect(route)),
            None => Err(err),
        }
    }

    /// Map an error from any component to a navigation, if it calls for one.
    pub fn route_for(&self, err: &ClientError) -> Option<Route> {
        self.guard.on_error(err)
    }

    pub async fn load_me(&self) -> Result<SessionInfo> {
        let epoch = self.session.epoch();
        let res = self.http.call_json::<SessionInfo>(ApiRequest::get("/api/app/me")).await;
        let mut view = self.view();
        // a reply for an older credential must not describe the current one
        if view.epoch != epoch {
            return res;
        }
        match &res {
            Ok(info) => {
                view.info = Some(info.clone());
                view.status = "Session OK".to_string();
            }
            Err(e) => view.status = e.to_string(),
        }
        res
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<Claims> {
        let email = email.trim();
        if email.is_empty() || password.is_empty() {
            return Err(ClientError::validation("Email and password required"));
        }
        self.authenticate(ApiRequest::post_json(
            "/api/auth/login",
            json!({ "email": email, "password": password }),
        ))
        .await
    }

    pub async fn register(&self, email: &str, password: &str, org_name: &str) -> Result<Claims> {
        let email = email.trim();
        if email.is_empty() || password.is_empty() {
            return Err(ClientError::validation("Email and password required"));
        }
        self.authenticate(ApiRequest::post_json(
            "/api/auth/register",
            json!({ "email": email, "password": password, "orgName": org_name.trim() }),
        ))
        .await
    }

    async fn authenticate(&self, req: ApiRequest) -> Result<Claims> {
        let resp: TokenResponse = self.http.call_json(req.anonymous()).await?;
        // Credential and profile namespace switch together; every component
        // sees the new epoch before its next request
        self.session.establish(&resp.token)
    }

    /// Teardown: drop the credential; every component resets on its next use.
    pub fn logout(&self) {
        self.session.logout();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::RawResponse;
    use crate::session::AuthSignal;
    use crate::test_support::{mint_token, FakeTransport};

    fn build(page: Page, token: Option<&str>) -> (AppSession, Arc<FakeTransport>) {
        let store = LocalStore::temporary().unwrap();
        if let Some(t) = token {
            crate::credential::CredentialStore::new(store.clone()).set(t).unwrap();
        }
        let fake = Arc::new(FakeTransport::new());
        let app = AppSession::with_transport(ClientConfig::default(), store, fake.clone(), page);
        (app, fake)
    }

    #[tokio::test]
    async fn protected_pages_redirect_without_network() {
        for page in [Page::Home, Page::Admin] {
            let (app, fake) = build(page, None);
            assert_eq!(app.init().await.unwrap(), GuardDecision::Redirect(Route::Login));
            assert_eq!(fake.request_count(), 0);
        }
    }

    #[tokio::test]
    async fn undecodable_credential_counts_as_none() {
        let (app, fake) = build(Page::Home, Some("eyJhbGciOiJIUzI1NiJ9.%%%not-base64%%%.sig"));
        assert_eq!(app.init().await.unwrap(), GuardDecision::Redirect(Route::Login));
        assert_eq!(fake.request_count(), 0);

        let (app, fake) = build(Page::Home, Some("eyJhbGciOiJIUzI1NiJ9.bm90IGpzb24.sig"));
        assert_eq!(app.init().await.unwrap(), GuardDecision::Redirect(Route::Login));
        assert_eq!(fake.request_count(), 0);
    }

    #[tokio::test]
    async fn home_init_loads_session_clusters_and_history() {
        let token = mint_token("u-1", "a@x.io", false);
        let (app, fake) = build(Page::Home, Some(&token));
        fake.respond(
            "/api/app/me",
            RawResponse::json(200, &json!({"userId": "u-1", "org": {"ID": "o1", "Name": "acme"}, "sub": {"PlanID": "free", "Status": "active"}})),
        );
        fake.respond(
            "/api/app/clusters",
            RawResponse::json(200, &json!({"clusters": [{"ID": "c1", "Name": "prod"}, {"ID": "c2", "Name": "dev"}]})),
        );
        fake.respond("/api/app/scans", RawResponse::json(200, &json!({"scans": []})));

        let decision = app.init().await.unwrap();
        assert!(matches!(decision, GuardDecision::Proceed(Some(c)) if c.sub == "u-1"));
        assert_eq!(app.status(), "Session OK");
        assert_eq!(app.session_info().unwrap().user_id, "u-1");
        assert_eq!(app.workflow.cluster_id().as_deref(), Some("c1"));
        assert_eq!(fake.paths(), vec!["/api/app/me", "/api/app/clusters", "/api/app/scans"]);
    }

    #[tokio::test]
    async fn expired_token_mid_init_routes_to_login() {
        let token = mint_token("u-1", "a@x.io", false);
        let (app, fake) = build(Page::Home, Some(&token));
        fake.respond("/api/app/me", RawResponse::text(401, "invalid token"));

        assert_eq!(app.init().await.unwrap(), GuardDecision::Redirect(Route::Login));
        assert!(app.session().credential().is_none());
        assert_eq!(app.session().snapshot().signal, AuthSignal::Expired);
        assert_eq!(fake.request_count(), 1);
    }

    #[tokio::test]
    async fn session_info_is_dropped_once_the_token_expires() {
        let token = mint_token("u-1", "a@x.io", false);
        let (app, fake) = build(Page::Home, Some(&token));
        fake.respond(
            "/api/app/me",
            RawResponse::json(200, &json!({"userId": "u-1", "org": {"ID": "o1", "Name": "acme"}})),
        );
        fake.respond("/api/app/clusters", RawResponse::text(401, "token expired"));

        assert_eq!(app.init().await.unwrap(), GuardDecision::Redirect(Route::Login));
        assert!(app.session().credential().is_none());
        assert!(app.session_info().is_none());
        assert_eq!(app.status(), "");
    }

    #[tokio::test]
    async fn session_info_belongs_to_one_subject() {
        let token = mint_token("u-1", "a@x.io", false);
        let (app, fake) = build(Page::Home, Some(&token));
        fake.respond("/api/app/me", RawResponse::json(200, &json!({"userId": "u-1"})));
        app.load_me().await.unwrap();
        assert_eq!(app.status(), "Session OK");

        let other = mint_token("u-2", "b@x.io", false);
        fake.respond("/api/auth/login", RawResponse::json(200, &json!({ "token": other })));
        app.login("b@x.io", "pw").await.unwrap();
        assert!(app.session_info().is_none());
        assert_eq!(app.status(), "");
    }

    #[tokio::test]
    async fn forged_admin_claim_still_honours_403() {
        let token = mint_token("u-1", "a@x.io", true);
        let (app, fake) = build(Page::Admin, Some(&token));
        fake.respond("/api/admin/users", RawResponse::text(403, "admin only"));
        fake.respond("/api/admin/orgs", RawResponse::text(403, "admin only"));

        assert_eq!(app.init().await.unwrap(), GuardDecision::Redirect(Route::Home));
        assert!(app.session().credential().is_some());
    }

    #[tokio::test]
    async fn login_is_anonymous_and_switches_session() {
        let (app, fake) = build(Page::Login, None);
        let token = mint_token("u-9", "z@x.io", false);
        fake.respond("/api/auth/login", RawResponse::text(401, "invalid credentials"));
        fake.respond("/api/auth/login", RawResponse::json(200, &json!({ "token": token })));

        let err = app.login("z@x.io", "wrong").await.unwrap_err();
        assert_eq!(err.to_string(), "invalid credentials");
        assert!(app.session().credential().is_none());

        let claims = app.login(" z@x.io ", "right").await.unwrap();
        assert_eq!(claims.sub, "u-9");
        assert_eq!(app.session().snapshot().subject.as_deref(), Some("u-9"));
        assert!(fake.requests().iter().all(|r| r.bearer.is_none()));

        assert!(app.login("", "x").await.is_err());
        assert_eq!(fake.request_count(), 2);

        app.logout();
        assert!(app.session().credential().is_none());
    }
}
