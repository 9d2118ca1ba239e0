//! Seed script for a running rbacscan backend
//!
//! Goes through the client library exactly as the CLI would:
//! - registers (or logs in) an administrator and a regular user
//! - creates a cluster for the user and uploads a sample manifest
//! - as the administrator, moves the user's organisation to the pro plan
//!
//! Run: ADMIN_EMAILS=admin@example.com cargo run --bin rbacscan-devserver
//!      cargo run --bin seed_demo
//! The admin email must be listed in the backend's ADMIN_EMAILS.

use std::sync::Arc;

use rbacscan::app::AppSession;
use rbacscan::config::ClientConfig;
use rbacscan::error::ClientError;
use rbacscan::http::ReqwestTransport;
use rbacscan::logging::init_tracing;
use rbacscan::models::{ManifestFile, PlanId};
use rbacscan::session::Page;
use rbacscan::storage::LocalStore;

const PASSWORD: &str = "demo-password";

const SAMPLE_MANIFEST: &str = r#"
apiVersion: rbac.authorization.k8s.io/v1
kind: Role
metadata:
  name: pod-reader
  namespace: payments
rules:
  - apiGroups: [""]
    resources: ["pods", "pods/log"]
    verbs: ["get", "list", "watch"]
---
apiVersion: rbac.authorization.k8s.io/v1
kind: RoleBinding
metadata:
  name: read-pods
  namespace: payments
subjects:
  - kind: User
    name: jane
  - kind: ServiceAccount
    name: ci
    namespace: payments
roleRef:
  kind: Role
  name: pod-reader
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: secret-admin
rules:
  - apiGroups: [""]
    resources: ["secrets"]
    verbs: ["get", "list", "create", "delete"]
  - apiGroups: ["rbac.authorization.k8s.io"]
    resources: ["clusterrolebindings"]
    verbs: ["create", "bind"]
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRoleBinding
metadata:
  name: platform-secret-admin
subjects:
  - kind: Group
    name: platform
roleRef:
  kind: ClusterRole
  name: secret-admin
"#;

/// A fresh client identity with its own throwaway local store.
fn client(config: &ClientConfig, page: Page) -> Result<AppSession, ClientError> {
    let transport = Arc::new(ReqwestTransport::new(config.base_url.clone()));
    Ok(AppSession::with_transport(
        config.clone(),
        LocalStore::temporary()?,
        transport,
        page,
    ))
}

/// Register, or log in when the account already exists.
async fn sign_in(app: &AppSession, email: &str, org: &str) -> Result<(), ClientError> {
    match app.register(email, PASSWORD, org).await {
        Ok(_) => println!("registered {email}"),
        Err(ClientError::Server { status: 409, .. }) => {
            app.login(email, PASSWORD).await?;
            println!("logged in {email}");
        }
        Err(e) => return Err(e),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _guard = init_tracing("seed_demo", false, None);
    let config = ClientConfig::from_env()?;
    let admin_email = std::env::var("SEED_ADMIN_EMAIL").unwrap_or_else(|_| "admin@example.com".to_string());
    let user_email = std::env::var("SEED_USER_EMAIL").unwrap_or_else(|_| "jane@example.com".to_string());

    println!("seeding {}", config.base_url);

    let admin = client(&config, Page::Register)?;
    sign_in(&admin, &admin_email, "Platform Team").await?;

    let user = client(&config, Page::Register)?;
    sign_in(&user, &user_email, "Payments").await?;

    // Reuse an existing cluster on reruns; the free plan allows only one
    let clusters = user.catalog.load().await?;
    let cluster = match clusters.into_iter().find(|c| c.name == "payments-prod") {
        Some(c) => c,
        None => user.catalog.create("payments-prod", "seeded demo cluster").await?,
    };
    println!("cluster {} ({})", cluster.name, cluster.id);

    user.workflow.select_cluster(&cluster.id).await?;
    let manifest = ManifestFile::new("rbac.yaml", SAMPLE_MANIFEST);
    let scan = user.workflow.upload_scan(Some(&manifest)).await?;
    if let Some(summary) = user.workflow.summary() {
        println!(
            "scan {}: {} subjects, {} dangerous grants, risk {:.1}",
            scan.id, summary.counts.subjects, summary.counts.danger_roles, summary.risk_score
        );
    }

    let me = user.load_me().await?;
    match me.org {
        Some(org) => match admin.admin.load_orgs().await {
            Ok(_) => {
                admin.admin.set_org_plan(&org.id, PlanId::Pro).await?;
                println!("{} moved to the pro plan", org.name);
            }
            Err(ClientError::PermissionDenied) => {
                println!("{admin_email} is not an administrator; add it to ADMIN_EMAILS to seed plans");
            }
            Err(e) => return Err(e.into()),
        },
        None => println!("no organisation reported for {user_email}"),
    }

    println!("done");
    Ok(())
}
