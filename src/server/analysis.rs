//! Fixture RBAC analyser used by the development backend.
//!
//! Reads Role, ClusterRole, RoleBinding and ClusterRoleBinding objects from
//! multi-document YAML (including `kind: List`), resolves every binding to
//! its role and flattens rules to one permission per
//! apiGroup x resource x verb.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Default, Deserialize)]
struct ObjectMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PolicyRule {
    #[serde(default)]
    api_groups: Vec<String>,
    #[serde(default)]
    resources: Vec<String>,
    #[serde(default)]
    verbs: Vec<String>,
    #[serde(default)]
    resource_names: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RoleDoc {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    rules: Vec<PolicyRule>,
}

#[derive(Debug, Deserialize)]
struct SubjectDoc {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: String,
}

#[derive(Debug, Default, Deserialize)]
struct RoleRef {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BindingDoc {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    subjects: Vec<SubjectDoc>,
    #[serde(default)]
    role_ref: RoleRef,
}

#[derive(Default)]
struct Manifest {
    roles: Vec<RoleDoc>,
    cluster_roles: Vec<RoleDoc>,
    role_bindings: Vec<BindingDoc>,
    cluster_role_bindings: Vec<BindingDoc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    pub api_group: String,
    pub resource: String,
    pub verb: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resource_names: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub cluster_scope: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveRole {
    pub source_kind: String,
    pub source_name: String,
    pub source_namespace: String,
    pub cluster_scope: bool,
    pub permissions: Vec<Permission>,
    pub dangerous: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub danger_reasons: Vec<String>,
    pub bound_via: String,
    pub binding_name: String,
    #[serde(rename = "bindingNS")]
    pub binding_ns: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub binding_subjects: Vec<String>,
}

/// Subject string -> role grants, ordered by subject.
#[derive(Debug, Default)]
pub struct Analysis {
    pub subjects: BTreeMap<String, Vec<EffectiveRole>>,
}

fn push_doc(value: serde_yaml::Value, out: &mut Manifest) {
    let kind = value
        .get("kind")
        .and_then(|k| k.as_str())
        .unwrap_or_default()
        .to_string();
    let parsed = match kind.as_str() {
        "List" => {
            if let Some(items) = value.get("items").and_then(|i| i.as_sequence()) {
                for item in items {
                    push_doc(item.clone(), out);
                }
            }
            return;
        }
        "Role" => serde_yaml::from_value(value).map(|r| out.roles.push(r)),
        "ClusterRole" => serde_yaml::from_value(value).map(|r| out.cluster_roles.push(r)),
        "RoleBinding" => serde_yaml::from_value(value).map(|b| out.role_bindings.push(b)),
        "ClusterRoleBinding" => serde_yaml::from_value(value).map(|b| out.cluster_role_bindings.push(b)),
        _ => Ok(()),
    };
    if let Err(e) = parsed {
        tracing::debug!(%kind, error = %e, "skipping malformed object");
    }
}

fn parse(content: &[u8]) -> Result<Manifest, serde_yaml::Error> {
    let mut out = Manifest::default();
    for doc in serde_yaml::Deserializer::from_slice(content) {
        let value = serde_yaml::Value::deserialize(doc)?;
        if !value.is_null() {
            push_doc(value, &mut out);
        }
    }
    Ok(out)
}

fn subject_string(s: &SubjectDoc, default_ns: &str) -> String {
    match s.kind.as_str() {
        "User" | "Group" => format!("{}:{}", s.kind, s.name),
        "ServiceAccount" => {
            let ns = if s.namespace.is_empty() { default_ns } else { &s.namespace };
            if ns.is_empty() {
                format!("ServiceAccount:{}", s.name)
            } else {
                format!("ServiceAccount:{}/{}", ns, s.name)
            }
        }
        other => format!("User:{}:{}", other, s.name),
    }
}

fn lower_set(items: &[String]) -> HashSet<String> {
    items.iter().map(|v| v.trim().to_lowercase()).collect()
}

fn has_any(set: &HashSet<String>, keys: &[&str]) -> bool {
    keys.iter().any(|k| set.contains(*k))
}

/// Danger heuristics over a role's rules; reasons are de-duplicated in
/// first-seen order.
fn danger_of(rules: &[PolicyRule]) -> (bool, Vec<String>) {
    let star = |items: &[String]| items.iter().any(|v| v.trim() == "*");
    let mut reasons: Vec<&str> = vec![];
    for rule in rules {
        let verbs = lower_set(&rule.verbs);
        let resources = lower_set(&rule.resources);

        if star(&rule.verbs) && star(&rule.resources) {
            reasons.push("Full admin: verbs=* and resources=*");
        }
        if has_any(&resources, &["roles", "clusterroles", "rolebindings", "clusterrolebindings"])
            && has_any(&verbs, &["create", "update", "patch", "delete", "*"])
        {
            reasons.push("Can modify RBAC objects (potential privilege escalation)");
        }
        if has_any(&resources, &["secrets", "*"]) && has_any(&verbs, &["get", "list", "watch", "*"]) {
            reasons.push("Can read Secrets (sensitive data exposure)");
        }
        if has_any(&resources, &["pods/exec", "pods/attach", "pods", "*"])
            && has_any(&verbs, &["create", "update", "patch", "delete", "get", "*"])
        {
            reasons.push("Can exec/attach into pods (remote code execution)");
        }
        if has_any(&resources, &["pods", "deployments", "statefulsets", "daemonsets", "*"])
            && has_any(&verbs, &["create", "update", "patch", "delete", "*"])
        {
            reasons.push("Can control workload objects (deploy arbitrary code)");
        }
        if has_any(&resources, &["configmaps", "*"]) && has_any(&verbs, &["get", "list", "watch", "*"]) {
            reasons.push("Can read ConfigMaps (configuration/secret leakage)");
        }
    }
    let mut seen = HashSet::new();
    let unique: Vec<String> = reasons
        .into_iter()
        .filter(|r| seen.insert(*r))
        .map(str::to_string)
        .collect();
    (!unique.is_empty(), unique)
}

fn flatten(rules: &[PolicyRule], namespace: &str, cluster_scope: bool) -> Vec<Permission> {
    let or_blank = |v: &[String]| if v.is_empty() { vec![String::new()] } else { v.to_vec() };
    let mut perms = vec![];
    for r in rules {
        for g in or_blank(&r.api_groups) {
            for res in or_blank(&r.resources) {
                for verb in or_blank(&r.verbs) {
                    perms.push(Permission {
                        api_group: g.clone(),
                        resource: res.clone(),
                        verb,
                        resource_names: r.resource_names.clone(),
                        namespace: namespace.to_string(),
                        cluster_scope,
                    });
                }
            }
        }
    }
    perms
}

pub fn analyze(content: &[u8]) -> Result<Analysis, serde_yaml::Error> {
    let m = parse(content)?;
    let roles: HashMap<(String, String), &RoleDoc> = m
        .roles
        .iter()
        .map(|r| ((r.metadata.namespace.clone(), r.metadata.name.clone()), r))
        .collect();
    let cluster_roles: HashMap<&str, &RoleDoc> =
        m.cluster_roles.iter().map(|r| (r.metadata.name.as_str(), r)).collect();

    let mut out = Analysis::default();

    for rb in &m.role_bindings {
        let ns = rb.metadata.namespace.as_str();
        let all: Vec<String> = rb.subjects.iter().map(|s| subject_string(s, ns)).collect();
        let grant = match rb.role_ref.kind.as_str() {
            "Role" => roles
                .get(&(ns.to_string(), rb.role_ref.name.clone()))
                .map(|role| ("Role", *role, role.metadata.namespace.clone(), false)),
            "ClusterRole" => cluster_roles
                .get(rb.role_ref.name.as_str())
                .map(|cr| ("ClusterRole", *cr, String::new(), false)),
            _ => None,
        };
        let Some((kind, role, source_ns, cluster_scope)) = grant else {
            continue;
        };
        let (dangerous, reasons) = danger_of(&role.rules);
        for (subj, s) in rb.subjects.iter().zip(&all) {
            if subj.name.is_empty() {
                continue;
            }
            out.subjects.entry(s.clone()).or_default().push(EffectiveRole {
                source_kind: kind.to_string(),
                source_name: role.metadata.name.clone(),
                source_namespace: source_ns.clone(),
                cluster_scope,
                permissions: flatten(&role.rules, &source_ns, cluster_scope),
                dangerous,
                danger_reasons: reasons.clone(),
                bound_via: "RoleBinding".to_string(),
                binding_name: rb.metadata.name.clone(),
                binding_ns: ns.to_string(),
                binding_subjects: all.clone(),
            });
        }
    }

    for crb in &m.cluster_role_bindings {
        let all: Vec<String> = crb.subjects.iter().map(|s| subject_string(s, "")).collect();
        let Some(cr) = cluster_roles.get(crb.role_ref.name.as_str()) else {
            continue;
        };
        let (dangerous, reasons) = danger_of(&cr.rules);
        for (subj, s) in crb.subjects.iter().zip(&all) {
            if subj.name.is_empty() {
                continue;
            }
            out.subjects.entry(s.clone()).or_default().push(EffectiveRole {
                source_kind: "ClusterRole".to_string(),
                source_name: cr.metadata.name.clone(),
                source_namespace: String::new(),
                cluster_scope: true,
                permissions: flatten(&cr.rules, "", true),
                dangerous,
                danger_reasons: reasons.clone(),
                bound_via: "ClusterRoleBinding".to_string(),
                binding_name: crb.metadata.name.clone(),
                binding_ns: String::new(),
                binding_subjects: all.clone(),
            });
        }
    }
    Ok(out)
}

impl Analysis {
    /// Keep dangerous grants only and/or grants effective in `namespace`
    /// (cluster-wide grants always are). Subjects left with nothing drop out.
    pub fn filtered(mut self, danger_only: bool, namespace: &str) -> Self {
        let ns = namespace.trim();
        if !danger_only && ns.is_empty() {
            return self;
        }
        for roles in self.subjects.values_mut() {
            roles.retain(|r| {
                (!danger_only || r.dangerous) && (ns.is_empty() || r.cluster_scope || r.source_namespace == ns)
            });
        }
        self.subjects.retain(|_, roles| !roles.is_empty());
        self
    }

    pub fn report(&self) -> Value {
        let subjects: Vec<Value> = self
            .subjects
            .iter()
            .map(|(subject, roles)| json!({ "subject": subject, "roles": roles }))
            .collect();
        json!({ "subjects": subjects })
    }

    pub fn summary(&self) -> Value {
        let (mut roles, mut perms, mut danger_roles) = (0usize, 0usize, 0usize);
        let mut top_danger = vec![];
        for (subject, grants) in &self.subjects {
            let p: usize = grants.iter().map(|g| g.permissions.len()).sum();
            let d = grants.iter().filter(|g| g.dangerous).count();
            roles += grants.len();
            perms += p;
            danger_roles += d;
            if d > 0 {
                top_danger.push(json!({ "subject": subject, "dangerRoles": d, "perms": p }));
            }
        }
        let risk_score = if roles > 0 {
            (danger_roles as f64 / roles as f64 * 10.0).min(10.0)
        } else {
            0.0
        };
        json!({
            "counts": {
                "subjects": self.subjects.len(),
                "roles": roles,
                "perms": perms,
                "dangerRoles": danger_roles,
            },
            "riskScore": risk_score,
            "topDanger": top_danger,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
apiVersion: rbac.authorization.k8s.io/v1
kind: Role
metadata: {name: reader, namespace: team-a}
rules:
  - apiGroups: [""]
    resources: [services, endpoints]
    verbs: [get, list]
---
apiVersion: rbac.authorization.k8s.io/v1
kind: RoleBinding
metadata: {name: read-services, namespace: team-a}
subjects:
  - {kind: User, name: alice}
  - {kind: ServiceAccount, name: builder}
roleRef: {kind: Role, name: reader, apiGroup: rbac.authorization.k8s.io}
---
apiVersion: v1
kind: List
items:
  - apiVersion: rbac.authorization.k8s.io/v1
    kind: ClusterRole
    metadata: {name: god}
    rules:
      - {apiGroups: ["*"], resources: ["*"], verbs: ["*"]}
  - apiVersion: rbac.authorization.k8s.io/v1
    kind: ClusterRoleBinding
    metadata: {name: ops-god}
    subjects: [{kind: Group, name: ops}]
    roleRef: {kind: ClusterRole, name: god}
"#;

    #[test]
    fn resolves_bindings_and_flattens_rules() {
        let a = analyze(MANIFEST.as_bytes()).unwrap();
        let keys: Vec<_> = a.subjects.keys().cloned().collect();
        assert_eq!(keys, vec!["Group:ops", "ServiceAccount:team-a/builder", "User:alice"]);

        let alice = &a.subjects["User:alice"][0];
        assert_eq!(alice.source_kind, "Role");
        assert!(!alice.cluster_scope);
        // 1 group x 2 resources x 2 verbs
        assert_eq!(alice.permissions.len(), 4);
        assert!(!alice.dangerous);

        let ops = &a.subjects["Group:ops"][0];
        assert!(ops.cluster_scope);
        assert_eq!(ops.bound_via, "ClusterRoleBinding");
        assert_eq!(ops.danger_reasons[0], "Full admin: verbs=* and resources=*");
        // wildcard resources do not name RBAC objects
        assert_eq!(ops.danger_reasons.len(), 5);
    }

    #[test]
    fn secrets_reader_is_flagged() {
        let rules = vec![PolicyRule {
            resources: vec!["Secrets".into()],
            verbs: vec!["list".into()],
            ..Default::default()
        }];
        let (dangerous, reasons) = danger_of(&rules);
        assert!(dangerous);
        assert_eq!(reasons, vec!["Can read Secrets (sensitive data exposure)"]);
    }

    #[test]
    fn reading_pods_counts_as_exec() {
        let rules = vec![PolicyRule {
            resources: vec!["pods".into()],
            verbs: vec!["get".into()],
            ..Default::default()
        }];
        let (dangerous, reasons) = danger_of(&rules);
        assert!(dangerous);
        assert_eq!(reasons, vec!["Can exec/attach into pods (remote code execution)"]);
    }

    #[test]
    fn filters_and_summary() {
        let a = analyze(MANIFEST.as_bytes()).unwrap();
        let s = a.summary();
        assert_eq!(s["counts"]["subjects"], 3);
        assert_eq!(s["counts"]["dangerRoles"], 1);

        let danger = analyze(MANIFEST.as_bytes()).unwrap().filtered(true, "");
        assert_eq!(danger.subjects.len(), 1);

        let other_ns = analyze(MANIFEST.as_bytes()).unwrap().filtered(false, "team-b");
        assert_eq!(other_ns.subjects.keys().collect::<Vec<_>>(), vec!["Group:ops"]);
    }

    #[test]
    fn broken_yaml_is_an_error() {
        assert!(analyze(b"kind: [Role\nrules: {").is_err());
    }
}
