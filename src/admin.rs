//! Operator views over users and organisations.
//!
//! Row edits are optimistic: the new value is applied locally, one PATCH
//! goes out, and the row is either confirmed from the response or restored
//! to its previous value. Each row carries its own pending flag so edits to
//! different rows proceed independently.

use parking_lot::{Mutex, MutexGuard};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ClientError, Result};
use crate::http::{ApiRequest, HttpClient};
use crate::models::{Organization, PlanId, User};

/// A record type listed by the admin panel.
pub trait AdminRecord: DeserializeOwned + Clone + Send {
    const NOUN: &'static str;
    fn key(&self) -> &str;
}

impl AdminRecord for User {
    const NOUN: &'static str = "user";
    fn key(&self) -> &str {
        &self.id
    }
}

impl AdminRecord for Organization {
    const NOUN: &'static str = "org";
    fn key(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdminRow<T> {
    pub item: T,
    pub pending: bool,
    /// Inline error from the last failed edit.
    pub error: Option<String>,
}

struct AdminList<T> {
    epoch: u64,
    /// Bumped on every successful reload.
    generation: u64,
    rows: Vec<AdminRow<T>>,
    status: String,
}

impl<T> AdminList<T> {
    fn new(epoch: u64) -> Self {
        Self {
            epoch,
            generation: 0,
            rows: vec![],
            status: String::new(),
        }
    }

    fn row_mut(&mut self, key: &str) -> Option<&mut AdminRow<T>>
    where
        T: AdminRecord,
    {
        self.rows.iter_mut().find(|r| r.item.key() == key)
    }
}

#[derive(Deserialize)]
struct UserList {
    #[serde(default)]
    users: Vec<User>,
}

#[derive(Deserialize)]
struct OrgList {
    #[serde(default)]
    orgs: Vec<Organization>,
}

pub struct AdminPanel {
    http: HttpClient,
    limit: usize,
    users: Mutex<AdminList<User>>,
    orgs: Mutex<AdminList<Organization>>,
}

impl AdminPanel {
    pub fn new(http: HttpClient, limit: usize) -> Self {
        let epoch = http.session().epoch();
        Self {
            http,
            limit,
            users: Mutex::new(AdminList::new(epoch)),
            orgs: Mutex::new(AdminList::new(epoch)),
        }
    }

    fn lock<'a, T>(&self, list: &'a Mutex<AdminList<T>>) -> MutexGuard<'a, AdminList<T>> {
        let epoch = self.http.session().epoch();
        let mut guard = list.lock();
        if guard.epoch != epoch {
            *guard = AdminList::new(epoch);
        }
        guard
    }

    pub fn users(&self) -> Vec<AdminRow<User>> {
        self.lock(&self.users).rows.clone()
    }

    pub fn orgs(&self) -> Vec<AdminRow<Organization>> {
        self.lock(&self.orgs).rows.clone()
    }

    pub fn users_status(&self) -> String {
        self.lock(&self.users).status.clone()
    }

    pub fn orgs_status(&self) -> String {
        self.lock(&self.orgs).status.clone()
    }

    pub async fn load_users(&self) -> Result<Vec<User>> {
        let res = self
            .http
            .call_json::<UserList>(ApiRequest::get("/api/admin/users").query("limit", self.limit))
            .await
            .map(|l| l.users);
        self.apply_list(&self.users, res, "No users")
    }

    pub async fn load_orgs(&self) -> Result<Vec<Organization>> {
        let res = self
            .http
            .call_json::<OrgList>(ApiRequest::get("/api/admin/orgs").query("limit", self.limit))
            .await
            .map(|l| l.orgs);
        self.apply_list(&self.orgs, res, "No orgs")
    }

    fn apply_list<T: AdminRecord>(
        &self,
        list: &Mutex<AdminList<T>>,
        res: Result<Vec<T>>,
        empty: &str,
    ) -> Result<Vec<T>> {
        let mut st = self.lock(list);
        match res {
            Ok(items) => {
                st.generation += 1;
                st.status = if items.is_empty() {
                    empty.to_string()
                } else {
                    format!("Loaded {} {}(s)", items.len(), T::NOUN)
                };
                st.rows = items
                    .iter()
                    .cloned()
                    .map(|item| AdminRow {
                        item,
                        pending: false,
                        error: None,
                    })
                    .collect();
                tracing::info!(kind = T::NOUN, count = items.len(), "admin list loaded");
                Ok(items)
            }
            Err(e) => {
                st.status = e.to_string();
                Err(e)
            }
        }
    }

    pub async fn set_user_admin(&self, user_id: &str, is_admin: bool) -> Result<User> {
        self.optimistic(
            &self.users,
            user_id,
            ApiRequest::patch_json("/api/admin/users", json!({ "userId": user_id, "isAdmin": is_admin })),
            |u: &mut User| u.is_admin = is_admin,
        )
        .await
    }

    pub async fn set_org_plan(&self, org_id: &str, plan: PlanId) -> Result<Organization> {
        self.optimistic(
            &self.orgs,
            org_id,
            ApiRequest::patch_json("/api/admin/orgs", json!({ "orgId": org_id, "planId": plan })),
            |o: &mut Organization| {
                o.plan_id = plan;
                o.max_clusters = plan.max_clusters();
            },
        )
        .await
    }

    /// Apply locally, send, then confirm or compensate.
    async fn optimistic<T: AdminRecord>(
        &self,
        list: &Mutex<AdminList<T>>,
        key: &str,
        req: ApiRequest,
        apply: impl Fn(&mut T),
    ) -> Result<T> {
        let (epoch, generation, previous) = {
            let mut st = self.lock(list);
            let (epoch, generation) = (st.epoch, st.generation);
            let Some(row) = st.row_mut(key) else {
                return Err(ClientError::validation(format!("Unknown {} {key}", T::NOUN)));
            };
            if row.pending {
                return Err(ClientError::validation("Update already in progress"));
            }
            let previous = row.item.clone();
            apply(&mut row.item);
            row.pending = true;
            row.error = None;
            (epoch, generation, previous)
        };

        let res = self.http.call(req).await;

        let mut st = self.lock(list);
        if st.epoch != epoch {
            return res.and_then(|body| confirmed(body, previous, &apply));
        }
        let reloaded = st.generation != generation;
        let Some(row) = st.row_mut(key) else {
            // Row vanished in a reload; nothing left to reconcile
            return res.and_then(|body| confirmed(body, previous, &apply));
        };
        row.pending = false;
        match res {
            Ok(body) => {
                let saved = confirmed(body, row.item.clone(), &apply)?;
                row.item = saved.clone();
                st.status = "Saved".to_string();
                tracing::info!(kind = T::NOUN, key, "admin edit saved");
                Ok(saved)
            }
            Err(e) => {
                // A reload already replaced the row with server state
                if !reloaded {
                    row.item = previous;
                }
                row.error = Some(e.to_string());
                tracing::warn!(kind = T::NOUN, key, error = %e, "admin edit rolled back");
                Err(e)
            }
        }
    }
}

/// Server copy when the response parses as a row, otherwise the local value
/// with the edit applied.
fn confirmed<T: AdminRecord>(body: Option<Value>, mut local: T, apply: &impl Fn(&mut T)) -> Result<T> {
    match body.and_then(|v| serde_json::from_value::<T>(v).ok()) {
        Some(server) => Ok(server),
        None => {
            apply(&mut local);
            Ok(local)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::RawResponse;
    use crate::session::{Page, Route, SessionGuard};
    use crate::test_support::{session_as, FakeTransport};
    use std::sync::Arc;

    const USERS: &str = "/api/admin/users";
    const ORGS: &str = "/api/admin/orgs";

    fn panel() -> (AdminPanel, Arc<FakeTransport>) {
        let fake = Arc::new(FakeTransport::new());
        let http = HttpClient::new(fake.clone(), session_as(Some(("root", true))));
        (AdminPanel::new(http, 200), fake)
    }

    fn user(id: &str, admin: bool) -> Value {
        json!({"id": id, "email": format!("{id}@x.io"), "isAdmin": admin, "createdAt": "2026-01-01T00:00:00Z"})
    }

    fn users(list: &[Value]) -> RawResponse {
        RawResponse::json(200, &json!({ "users": list }))
    }

    fn admin_flag(p: &AdminPanel, id: &str) -> bool {
        p.users().into_iter().find(|r| r.item.id == id).unwrap().item.is_admin
    }

    #[tokio::test]
    async fn list_status_and_limit() {
        let (p, fake) = panel();
        fake.respond(USERS, users(&[]));
        fake.respond(USERS, users(&[user("u1", false), user("u2", true)]));

        p.load_users().await.unwrap();
        assert_eq!(p.users_status(), "No users");
        assert_eq!(fake.requests()[0].request.query_value("limit"), Some("200"));

        p.load_users().await.unwrap();
        assert_eq!(p.users_status(), "Loaded 2 user(s)");
        assert_eq!(p.users().len(), 2);
    }

    #[tokio::test]
    async fn toggle_success_survives_reload() {
        let (p, fake) = panel();
        fake.respond(USERS, users(&[user("u1", false)]));
        p.load_users().await.unwrap();

        fake.respond(USERS, RawResponse::json(200, &user("u1", true)));
        fake.respond(USERS, users(&[user("u1", true)]));

        let saved = p.set_user_admin("u1", true).await.unwrap();
        assert!(saved.is_admin);
        assert!(admin_flag(&p, "u1"));
        assert_eq!(p.users_status(), "Saved");

        p.load_users().await.unwrap();
        assert!(admin_flag(&p, "u1"));

        let patch = &fake.requests()[1].request;
        assert_eq!(patch.method, crate::http::Method::PATCH);
        assert_eq!(
            patch.body,
            crate::http::RequestBody::Json(json!({"userId": "u1", "isAdmin": true}))
        );
    }

    #[tokio::test]
    async fn toggle_failure_rolls_back_with_inline_error() {
        let (p, fake) = panel();
        fake.respond(USERS, users(&[user("u1", false)]));
        p.load_users().await.unwrap();

        fake.respond(USERS, RawResponse::text(500, "db down"));
        assert!(p.set_user_admin("u1", true).await.is_err());

        let row = p.users().remove(0);
        assert!(!row.item.is_admin);
        assert!(!row.pending);
        assert_eq!(row.error.as_deref(), Some("db down"));
    }

    #[tokio::test]
    async fn edits_to_different_rows_are_independent() {
        let (p, fake) = panel();
        fake.respond(USERS, users(&[user("u1", false), user("u2", false)]));
        p.load_users().await.unwrap();

        let hold = fake.hold(USERS, RawResponse::text(500, "u1 failed"));
        fake.respond(USERS, RawResponse::json(200, &user("u2", true)));

        let (first, second) = tokio::join!(p.set_user_admin("u1", true), async {
            hold.issued.notified().await;
            // optimistic value visible while in flight
            assert!(admin_flag(&p, "u1"));
            assert!(matches!(
                p.set_user_admin("u1", false).await,
                Err(ClientError::Validation(_))
            ));
            let r = p.set_user_admin("u2", true).await;
            hold.release.notify_one();
            r
        });

        assert!(first.is_err());
        assert!(second.unwrap().is_admin);
        assert!(!admin_flag(&p, "u1"));
        assert!(admin_flag(&p, "u2"));
    }

    #[tokio::test]
    async fn forbidden_keeps_session_and_routes_home() {
        let (p, fake) = panel();
        fake.respond(USERS, RawResponse::text(403, "admin only"));
        let err = p.load_users().await.unwrap_err();
        assert!(err.is_permission_denied());
        assert!(p.http.session().credential().is_some());

        let guard = SessionGuard::new(p.http.session().clone(), Page::Admin);
        assert_eq!(guard.on_error(&err), Some(Route::Home));
    }

    #[tokio::test]
    async fn plan_change_updates_allowance() {
        let (p, fake) = panel();
        fake.respond(
            ORGS,
            RawResponse::json(
                200,
                &json!({"orgs": [{"id": "o1", "name": "acme", "ownerEmail": "a@x.io", "planId": "free", "clustersCount": 1, "maxClusters": 1}]}),
            ),
        );
        p.load_orgs().await.unwrap();
        assert_eq!(p.orgs_status(), "Loaded 1 org(s)");

        fake.respond(ORGS, RawResponse::text(204, ""));
        let org = p.set_org_plan("o1", PlanId::Pro).await.unwrap();
        assert_eq!(org.plan_id, PlanId::Pro);
        assert_eq!(org.max_clusters, 5);
        assert_eq!(p.orgs()[0].item.plan_id, PlanId::Pro);
    }

    #[tokio::test]
    async fn unknown_row_is_rejected_locally() {
        let (p, fake) = panel();
        assert!(p.set_user_admin("ghost", true).await.is_err());
        assert_eq!(fake.request_count(), 0);
    }
}
