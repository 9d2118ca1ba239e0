use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;

use crate::error::{ClientError, Result};
use crate::http::{ApiRequest, HttpClient};
use crate::models::Cluster;

#[derive(Deserialize)]
struct ClusterList {
    #[serde(default)]
    clusters: Vec<Cluster>,
}

#[derive(Default)]
struct CatalogState {
    clusters: Vec<Cluster>,
    status: String,
    loaded_epoch: Option<u64>,
}

/// Clusters of the caller's organisation; feeds cluster selection.
pub struct ClusterCatalog {
    http: HttpClient,
    state: Mutex<CatalogState>,
}

impl ClusterCatalog {
    pub fn new(http: HttpClient) -> Self {
        Self {
            http,
            state: Mutex::new(CatalogState::default()),
        }
    }

    /// Clusters as of the last load; empty after a session change.
    pub fn clusters(&self) -> Vec<Cluster> {
        let epoch = self.http.session().epoch();
        let state = self.state.lock();
        if state.loaded_epoch == Some(epoch) {
            state.clusters.clone()
        } else {
            vec![]
        }
    }

    pub fn find(&self, id: &str) -> Option<Cluster> {
        self.clusters().into_iter().find(|c| c.id == id)
    }

    pub fn status(&self) -> String {
        self.state.lock().status.clone()
    }

    fn set_status(&self, msg: impl Into<String>) {
        self.state.lock().status = msg.into();
    }

    pub async fn load(&self) -> Result<Vec<Cluster>> {
        let epoch = self.http.session().epoch();
        let res = self
            .http
            .call_json::<ClusterList>(ApiRequest::get("/api/app/clusters"))
            .await;

        let list = match res {
            Ok(list) => list.clusters,
            Err(e) => {
                self.set_status(e.to_string());
                return Err(e);
            }
        };
        if self.http.session().epoch() != epoch {
            tracing::debug!("cluster list arrived for a previous session, dropped");
            return Ok(vec![]);
        }

        let mut state = self.state.lock();
        state.status = if list.is_empty() {
            "No clusters yet".to_string()
        } else {
            "Clusters loaded".to_string()
        };
        state.clusters = list.clone();
        state.loaded_epoch = Some(epoch);
        tracing::info!(count = list.len(), "clusters loaded");
        Ok(list)
    }

    pub async fn create(&self, name: &str, notes: &str) -> Result<Cluster> {
        let name = name.trim();
        if name.is_empty() {
            let err = ClientError::validation("Cluster name required");
            self.set_status(err.to_string());
            return Err(err);
        }

        let created: Cluster = match self
            .http
            .call_json(ApiRequest::post_json(
                "/api/app/clusters",
                json!({ "name": name, "notes": notes }),
            ))
            .await
        {
            Ok(c) => c,
            Err(e) => {
                self.set_status(e.to_string());
                return Err(e);
            }
        };
        tracing::info!(cluster_id = %created.id, "cluster created");

        // Refresh; on failure keep the list coherent with what we know exists
        if let Err(e) = self.load().await {
            tracing::warn!(error = %e, "reload after create failed");
            let epoch = self.http.session().epoch();
            let mut state = self.state.lock();
            if state.loaded_epoch == Some(epoch) && !state.clusters.iter().any(|c| c.id == created.id) {
                state.clusters.push(created.clone());
            }
        }
        self.set_status("Cluster added");
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::RawResponse;
    use crate::test_support::{session_as, FakeTransport};
    use serde_json::json;
    use std::sync::Arc;

    fn catalog() -> (ClusterCatalog, Arc<FakeTransport>) {
        let fake = Arc::new(FakeTransport::new());
        let http = HttpClient::new(fake.clone(), session_as(Some(("u-1", false))));
        (ClusterCatalog::new(http), fake)
    }

    #[tokio::test]
    async fn load_reports_empty_state() {
        let (cat, fake) = catalog();
        fake.respond("/api/app/clusters", RawResponse::json(200, &json!({"clusters": []})));
        assert!(cat.load().await.unwrap().is_empty());
        assert_eq!(cat.status(), "No clusters yet");
    }

    #[tokio::test]
    async fn create_requires_a_name_and_makes_no_request() {
        let (cat, fake) = catalog();
        let err = cat.create("   ", "").await.unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
        assert_eq!(fake.request_count(), 0);
    }

    #[tokio::test]
    async fn create_then_reload() {
        let (cat, fake) = catalog();
        fake.respond(
            "/api/app/clusters",
            RawResponse::json(200, &json!({"ID": "c1", "Name": "prod", "Notes": ""})),
        );
        fake.respond(
            "/api/app/clusters",
            RawResponse::json(200, &json!({"clusters": [{"ID": "c1", "Name": "prod"}]})),
        );
        let created = cat.create(" prod ", "").await.unwrap();
        assert_eq!(created.name, "prod");
        assert_eq!(cat.find("c1").map(|c| c.name), Some("prod".to_string()));
        assert_eq!(cat.status(), "Cluster added");

        let body = match &fake.requests()[0].request.body {
            crate::http::RequestBody::Json(v) => v.clone(),
            other => panic!("unexpected body {other:?}"),
        };
        assert_eq!(body["name"], "prod");
    }

    #[tokio::test]
    async fn plan_limit_surfaces_verbatim() {
        let (cat, fake) = catalog();
        fake.respond(
            "/api/app/clusters",
            RawResponse::text(402, "plan limit reached (upgrade required)"),
        );
        assert!(cat.create("staging", "").await.is_err());
        assert_eq!(cat.status(), "plan limit reached (upgrade required)");
    }
}
