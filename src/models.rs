use std::fmt;

use serde::{Deserialize, Serialize};

// Backend payloads come in two spellings: Go-style `ID`/`Name` for clusters,
// scans and org refs, camelCase elsewhere. Aliases accept both.

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub created_at: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PlanId {
    Free,
    Pro,
    Enterprise,
}

impl PlanId {
    pub const ALL: [PlanId; 3] = [PlanId::Free, PlanId::Pro, PlanId::Enterprise];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanId::Free => "free",
            PlanId::Pro => "pro",
            PlanId::Enterprise => "enterprise",
        }
    }

    /// Cluster allowance per organisation.
    pub fn max_clusters(&self) -> usize {
        match self {
            PlanId::Free => 1,
            PlanId::Pro => 5,
            PlanId::Enterprise => 50,
        }
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PlanId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(PlanId::Free),
            "pro" => Ok(PlanId::Pro),
            "enterprise" => Ok(PlanId::Enterprise),
            other => Err(format!("unknown plan {other:?} (expected free, pro or enterprise)")),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub owner_email: String,
    pub plan_id: PlanId,
    #[serde(default)]
    pub clusters_count: usize,
    #[serde(default)]
    pub max_clusters: usize,
    #[serde(default)]
    pub created_at: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    #[serde(alias = "ID")]
    pub id: String,
    #[serde(alias = "Name")]
    pub name: String,
    #[serde(default, alias = "Notes")]
    pub notes: String,
    #[serde(default, alias = "OrgID")]
    pub org_id: String,
}

/// One manifest upload. Append-only from the client's point of view.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScanRecord {
    #[serde(alias = "ID")]
    pub id: String,
    #[serde(alias = "ClusterID")]
    pub cluster_id: String,
    #[serde(default, alias = "Source")]
    pub source: String,
    #[serde(default, alias = "CreatedAt")]
    pub created_at: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct OrgRef {
    #[serde(alias = "ID")]
    pub id: String,
    #[serde(alias = "Name")]
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    #[serde(default, alias = "PlanID")]
    pub plan_id: String,
    #[serde(default, alias = "Status")]
    pub status: String,
}

/// `GET /api/app/me`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub user_id: String,
    #[serde(default)]
    pub org: Option<OrgRef>,
    #[serde(default)]
    pub sub: Option<Subscription>,
}

/// One role grant reaching a subject.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoleGrant {
    pub source_kind: String,
    #[serde(default)]
    pub source_namespace: String,
    pub source_name: String,
    #[serde(default)]
    pub cluster_scope: bool,
    #[serde(default)]
    pub bound_via: String,
    #[serde(default)]
    pub binding_name: String,
    #[serde(default)]
    pub permissions: Vec<serde_json::Value>,
    #[serde(default)]
    pub dangerous: bool,
    #[serde(default)]
    pub danger_reasons: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectGrants {
    pub subject: String,
    #[serde(default)]
    pub roles: Vec<RoleGrant>,
}

/// Structured permissions report, subject -> role grants.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    #[serde(default)]
    pub subjects: Vec<SubjectGrants>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReportCounts {
    pub subjects: usize,
    pub roles: usize,
    pub perms: usize,
    pub danger_roles: usize,
}

impl Report {
    pub fn counts(&self) -> ReportCounts {
        let mut c = ReportCounts {
            subjects: self.subjects.len(),
            ..Default::default()
        };
        for role in self.subjects.iter().flat_map(|s| s.roles.iter()) {
            c.roles += 1;
            c.perms += role.permissions.len();
            if role.dangerous {
                c.danger_roles += 1;
            }
        }
        c
    }

    pub fn subject(&self, name: &str) -> Option<&SubjectGrants> {
        self.subjects.iter().find(|s| s.subject == name)
    }
}

/// `summary` returned next to a freshly uploaded scan.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    #[serde(default)]
    pub counts: ReportCounts,
    #[serde(default)]
    pub risk_score: f64,
    #[serde(default)]
    pub top_danger: Vec<serde_json::Value>,
}

/// `POST /api/app/scans`
#[derive(Deserialize, Debug, Clone)]
pub struct UploadResponse {
    pub scan: ScanRecord,
    #[serde(default)]
    pub summary: Option<ScanSummary>,
}

/// Client-local display profile. Never sent to the server.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub bio: String,
    /// `data:` URL, empty when unset.
    #[serde(default)]
    pub avatar: String,
}

/// A manifest picked for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestFile {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl ManifestFile {
    pub fn new(file_name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes: bytes.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Renders an RFC 3339 timestamp in local time; anything else is shown as is.
pub fn format_timestamp(raw: &str) -> String {
    match chrono::DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => ts
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        Err(_) => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cluster_accepts_go_style_keys() {
        let c: Cluster = serde_json::from_value(json!({
            "ID": "c1", "OrgID": "o1", "Name": "prod", "Notes": "", "CreatedAt": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(c.id, "c1");
        assert_eq!(c.name, "prod");
        assert_eq!(c.org_id, "o1");
    }

    #[test]
    fn scan_accepts_camel_case_keys() {
        let s: ScanRecord = serde_json::from_value(json!({
            "id": "s1", "clusterId": "c1", "source": "upload", "createdAt": "x"
        }))
        .unwrap();
        assert_eq!(s.cluster_id, "c1");
        assert_eq!(s.source, "upload");
    }

    #[test]
    fn report_counts_add_up() {
        let report: Report = serde_json::from_value(json!({
            "subjects": [
                {"subject": "User:alice", "roles": [
                    {"sourceKind": "Role", "sourceName": "r", "permissions": [{}, {}], "dangerous": true},
                    {"sourceKind": "ClusterRole", "sourceName": "view", "permissions": [{}]}
                ]},
                {"subject": "Group:ops", "roles": []}
            ]
        }))
        .unwrap();
        let c = report.counts();
        assert_eq!(c.subjects, 2);
        assert_eq!(c.roles, 2);
        assert_eq!(c.perms, 3);
        assert_eq!(c.danger_roles, 1);
    }

    #[test]
    fn plan_id_parses_case_insensitively() {
        assert_eq!("Pro".parse::<PlanId>().unwrap(), PlanId::Pro);
        assert!("gold".parse::<PlanId>().is_err());
        assert_eq!(serde_json::to_string(&PlanId::Enterprise).unwrap(), "\"enterprise\"");
    }

    #[test]
    fn unparsable_timestamp_is_shown_verbatim() {
        assert_eq!(format_timestamp("yesterday"), "yesterday");
    }
}
