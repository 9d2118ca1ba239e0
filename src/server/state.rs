//! In-memory tables for the development backend.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::models::{Organization, PlanId, User};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Conflict(String),
    #[error("plan limit reached (upgrade required)")]
    PlanLimit,
}

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: String,
    pub email: String,
    pub password_hash: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

impl UserRecord {
    fn public(&self) -> User {
        User {
            id: self.id.clone(),
            email: self.email.clone(),
            is_admin: self.is_admin,
            created_at: self.created_at.to_rfc3339(),
        }
    }
}

// Cluster, scan and org rows go out with Go-style keys (`ID`, `Name`, ...)

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct OrgRow {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    #[serde(rename = "OwnerUserID")]
    pub owner_user_id: String,
    #[serde(skip)]
    pub plan: PlanId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SubscriptionRow {
    #[serde(rename = "OrgID")]
    pub org_id: String,
    #[serde(rename = "PlanID")]
    pub plan_id: PlanId,
    pub status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClusterRow {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "OrgID")]
    pub org_id: String,
    pub name: String,
    pub notes: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScanRow {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "OrgID")]
    pub org_id: String,
    #[serde(rename = "ClusterID")]
    pub cluster_id: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Tables {
    users: Vec<UserRecord>,
    orgs: Vec<OrgRow>,
    clusters: Vec<ClusterRow>,
    /// Append order; listing reverses it.
    scans: Vec<ScanRow>,
    results: HashMap<String, (Value, Value)>,
}

#[derive(Clone, Default)]
pub struct Store {
    tables: Arc<Mutex<Tables>>,
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// New user plus the organisation they own, on the free plan.
    pub fn create_user(
        &self,
        email: &str,
        password_hash: String,
        is_admin: bool,
        org_name: &str,
    ) -> Result<UserRecord, StoreError> {
        let mut t = self.tables.lock();
        if t.users.iter().any(|u| u.email == email) {
            return Err(StoreError::Conflict("email already registered".to_string()));
        }
        let now = Utc::now();
        let user = UserRecord {
            id: new_id(),
            email: email.to_string(),
            password_hash,
            is_admin,
            created_at: now,
        };
        t.orgs.push(OrgRow {
            id: new_id(),
            name: org_name.to_string(),
            owner_user_id: user.id.clone(),
            plan: PlanId::Free,
            created_at: now,
        });
        t.users.push(user.clone());
        Ok(user)
    }

    pub fn user(&self, id: &str) -> Option<UserRecord> {
        self.tables.lock().users.iter().find(|u| u.id == id).cloned()
    }

    pub fn user_by_email(&self, email: &str) -> Option<UserRecord> {
        self.tables.lock().users.iter().find(|u| u.email == email).cloned()
    }

    pub fn owner_org(&self, user_id: &str) -> Result<OrgRow, StoreError> {
        self.tables
            .lock()
            .orgs
            .iter()
            .find(|o| o.owner_user_id == user_id)
            .cloned()
            .ok_or(StoreError::NotFound("org"))
    }

    pub fn subscription(&self, org: &OrgRow) -> SubscriptionRow {
        SubscriptionRow {
            org_id: org.id.clone(),
            plan_id: org.plan,
            status: "active",
        }
    }

    pub fn list_users(&self, limit: usize) -> Vec<User> {
        let t = self.tables.lock();
        t.users.iter().rev().take(limit).map(UserRecord::public).collect()
    }

    pub fn set_admin(&self, user_id: &str, is_admin: bool) -> Result<User, StoreError> {
        let mut t = self.tables.lock();
        let user = t
            .users
            .iter_mut()
            .find(|u| u.id == user_id)
            .ok_or(StoreError::NotFound("user"))?;
        user.is_admin = is_admin;
        Ok(user.public())
    }

    fn org_view(t: &Tables, org: &OrgRow) -> Organization {
        Organization {
            id: org.id.clone(),
            name: org.name.clone(),
            owner_email: t
                .users
                .iter()
                .find(|u| u.id == org.owner_user_id)
                .map(|u| u.email.clone())
                .unwrap_or_default(),
            plan_id: org.plan,
            clusters_count: t.clusters.iter().filter(|c| c.org_id == org.id).count(),
            max_clusters: org.plan.max_clusters(),
            created_at: org.created_at.to_rfc3339(),
        }
    }

    pub fn list_orgs(&self, limit: usize) -> Vec<Organization> {
        let t = self.tables.lock();
        t.orgs.iter().rev().take(limit).map(|o| Self::org_view(&t, o)).collect()
    }

    pub fn set_plan(&self, org_id: &str, plan: PlanId) -> Result<Organization, StoreError> {
        let mut t = self.tables.lock();
        let org = t
            .orgs
            .iter_mut()
            .find(|o| o.id == org_id)
            .ok_or(StoreError::NotFound("org"))?;
        org.plan = plan;
        let org = org.clone();
        Ok(Self::org_view(&t, &org))
    }

    pub fn list_clusters(&self, org_id: &str) -> Vec<ClusterRow> {
        let t = self.tables.lock();
        t.clusters.iter().filter(|c| c.org_id == org_id).cloned().collect()
    }

    /// Enforces the organisation's plan allowance.
    pub fn create_cluster(&self, org: &OrgRow, name: &str, notes: &str) -> Result<ClusterRow, StoreError> {
        let mut t = self.tables.lock();
        let plan = t
            .orgs
            .iter()
            .find(|o| o.id == org.id)
            .map(|o| o.plan)
            .ok_or(StoreError::NotFound("org"))?;
        let count = t.clusters.iter().filter(|c| c.org_id == org.id).count();
        if count >= plan.max_clusters() {
            return Err(StoreError::PlanLimit);
        }
        let row = ClusterRow {
            id: new_id(),
            org_id: org.id.clone(),
            name: name.to_string(),
            notes: notes.to_string(),
            created_at: Utc::now(),
        };
        t.clusters.push(row.clone());
        Ok(row)
    }

    pub fn create_scan(
        &self,
        org_id: &str,
        cluster_id: &str,
        source: &str,
        summary: Value,
        report: Value,
    ) -> Result<ScanRow, StoreError> {
        let mut t = self.tables.lock();
        if !t.clusters.iter().any(|c| c.id == cluster_id && c.org_id == org_id) {
            return Err(StoreError::NotFound("cluster"));
        }
        let row = ScanRow {
            id: new_id(),
            org_id: org_id.to_string(),
            cluster_id: cluster_id.to_string(),
            source: source.to_string(),
            created_at: Utc::now(),
        };
        t.results.insert(row.id.clone(), (summary, report));
        t.scans.push(row.clone());
        Ok(row)
    }

    /// Newest first.
    pub fn list_scans(&self, org_id: &str, cluster_id: &str) -> Vec<ScanRow> {
        let t = self.tables.lock();
        t.scans
            .iter()
            .rev()
            .filter(|s| s.org_id == org_id && s.cluster_id == cluster_id)
            .cloned()
            .collect()
    }

    /// `(summary, report)` of a scan owned by `org_id`.
    pub fn scan_report(&self, org_id: &str, scan_id: &str) -> Result<(Value, Value), StoreError> {
        let t = self.tables.lock();
        t.scans
            .iter()
            .find(|s| s.id == scan_id && s.org_id == org_id)
            .and_then(|s| t.results.get(&s.id).cloned())
            .ok_or(StoreError::NotFound("report"))
    }
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub store: Store,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            store: Store::new(),
        }
    }
}
