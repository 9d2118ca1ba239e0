//! Report -> view model, plus HTML and terminal output.
//!
//! Subject names, role names and danger reasons come from uploaded
//! manifests, so every dynamic string is escaped for the target format
//! while the view model is built. The writers below do not escape again and
//! stay private; `render_text` pairs each view with its own writer.

use std::fmt::Write as _;

use crate::models::{Report, RoleGrant};

pub const EMPTY_REPORT_MESSAGE: &str = "No data (nothing left after filtering?)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Html,
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Cluster,
    Namespace,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Cluster => "cluster",
            Scope::Namespace => "namespace",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantView {
    pub source_kind: String,
    /// `-` when the source has no namespace.
    pub source_namespace: String,
    pub source_name: String,
    pub scope: Scope,
    pub bound_via: String,
    pub binding_name: String,
    pub dangerous: bool,
    pub danger_reasons: Vec<String>,
    pub permission_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectView {
    pub subject: String,
    pub grants: Vec<GrantView>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportView {
    Empty { message: String },
    Subjects(Vec<SubjectView>),
}

/// Escape for the given output format.
pub fn escape(s: &str, format: OutputFormat) -> String {
    match format {
        OutputFormat::Html => {
            let mut out = String::with_capacity(s.len());
            for c in s.chars() {
                match c {
                    '&' => out.push_str("&amp;"),
                    '<' => out.push_str("&lt;"),
                    '>' => out.push_str("&gt;"),
                    '"' => out.push_str("&quot;"),
                    '\'' => out.push_str("&#39;"),
                    c => out.push(c),
                }
            }
            out
        }
        // ANSI sequences and line breaks could forge report lines
        OutputFormat::Terminal => s
            .chars()
            .map(|c| if c.is_control() { '?' } else { c })
            .collect(),
    }
}

fn grant_view(role: &RoleGrant, format: OutputFormat) -> GrantView {
    let e = |s: &str| escape(s, format);
    let ns = if role.source_namespace.is_empty() {
        "-"
    } else {
        role.source_namespace.as_str()
    };
    GrantView {
        source_kind: e(&role.source_kind),
        source_namespace: e(ns),
        source_name: e(&role.source_name),
        // the flag decides; a namespace on a ClusterRole source says nothing
        scope: if role.cluster_scope {
            Scope::Cluster
        } else {
            Scope::Namespace
        },
        bound_via: e(&role.bound_via),
        binding_name: e(&role.binding_name),
        dangerous: role.dangerous,
        danger_reasons: role.danger_reasons.iter().map(|r| e(r)).collect(),
        permission_count: role.permissions.len(),
    }
}

pub fn render(report: &Report, format: OutputFormat) -> ReportView {
    if report.subjects.is_empty() {
        return ReportView::Empty {
            message: EMPTY_REPORT_MESSAGE.to_string(),
        };
    }
    ReportView::Subjects(
        report
            .subjects
            .iter()
            .map(|s| SubjectView {
                subject: escape(&s.subject, format),
                grants: s.roles.iter().map(|r| grant_view(r, format)).collect(),
            })
            .collect(),
    )
}

fn to_html(view: &ReportView) -> String {
    let subjects = match view {
        ReportView::Empty { message } => {
            return format!("<div class=\"results muted\">{}</div>", escape(message, OutputFormat::Html));
        }
        ReportView::Subjects(s) => s,
    };
    let mut out = String::from("<div class=\"results\">\n");
    for subj in subjects {
        let _ = writeln!(out, "<div class=\"subject\">\n<h3>{}</h3>", subj.subject);
        for g in &subj.grants {
            let _ = writeln!(
                out,
                "<div class=\"role\"><div class=\"head\">\
                 <span class=\"badge\">{}:{}/{}</span> \
                 <span class=\"badge scope\">scope:{}</span> \
                 <span class=\"badge\">via:{}/{}</span>{}</div>",
                g.source_kind,
                g.source_namespace,
                g.source_name,
                g.scope.as_str(),
                g.bound_via,
                g.binding_name,
                if g.dangerous {
                    " <span class=\"badge danger\">DANGEROUS</span>"
                } else {
                    ""
                }
            );
            if !g.danger_reasons.is_empty() {
                out.push_str("<div class=\"kv\">Danger reasons:</div><ul class=\"list\">\n");
                for r in &g.danger_reasons {
                    let _ = writeln!(out, "<li>{r}</li>");
                }
                out.push_str("</ul>\n");
            }
            let _ = writeln!(out, "<div class=\"kv\">Permissions: {}</div>\n</div>", g.permission_count);
        }
        out.push_str("</div>\n");
    }
    out.push_str("</div>\n");
    out
}

fn to_terminal(view: &ReportView) -> String {
    let subjects = match view {
        ReportView::Empty { message } => return format!("{message}\n"),
        ReportView::Subjects(s) => s,
    };
    let mut out = String::new();
    for subj in subjects {
        let _ = writeln!(out, "=== {} ===", subj.subject);
        for g in &subj.grants {
            let _ = writeln!(
                out,
                "  {}:{}/{} (via {}/{}){}",
                g.source_kind,
                g.source_namespace,
                g.source_name,
                g.bound_via,
                g.binding_name,
                if g.dangerous { " [DANGEROUS]" } else { "" }
            );
            let _ = writeln!(out, "    Scope: {}", g.scope.as_str());
            if !g.danger_reasons.is_empty() {
                out.push_str("    Danger reasons:\n");
                for r in &g.danger_reasons {
                    let _ = writeln!(out, "      - {r}");
                }
            }
            let _ = writeln!(out, "    Permissions: {}", g.permission_count);
        }
        out.push('\n');
    }
    out
}

/// Render straight to text in the given format.
pub fn render_text(report: &Report, format: OutputFormat) -> String {
    let view = render(report, format);
    match format {
        OutputFormat::Html => to_html(&view),
        OutputFormat::Terminal => to_terminal(&view),
    }
}
