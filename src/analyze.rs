//! One-off analysis of a manifest without a cluster or session.

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{ClientError, Result};
use crate::http::{ApiRequest, FormPart, HttpClient};
use crate::models::{ManifestFile, Report};
use crate::workflow::ReportDownload;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnalyzeOptions {
    /// Keep only grants touching this namespace; blank means all.
    pub namespace: String,
    pub danger_only: bool,
}

#[derive(Default)]
struct AnalyzerState {
    busy: bool,
    last: Option<(Value, Report)>,
    status: String,
}

pub struct AdHocAnalyzer {
    http: HttpClient,
    state: Mutex<AnalyzerState>,
}

struct Busy<'a>(&'a Mutex<AnalyzerState>);

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.0.lock().busy = false;
    }
}

impl AdHocAnalyzer {
    pub fn new(http: HttpClient) -> Self {
        Self {
            http,
            state: Mutex::new(AnalyzerState::default()),
        }
    }

    pub fn status(&self) -> String {
        self.state.lock().status.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.state.lock().busy
    }

    pub fn last_report(&self) -> Option<Report> {
        self.state.lock().last.as_ref().map(|(_, r)| r.clone())
    }

    fn fail<T>(&self, err: ClientError) -> Result<T> {
        self.state.lock().status = err.to_string();
        Err(err)
    }

    pub async fn analyze(&self, file: Option<&ManifestFile>, opts: &AnalyzeOptions) -> Result<Report> {
        let file = match file {
            Some(f) if !f.is_empty() => f,
            _ => return self.fail(ClientError::validation("Choose YAML file")),
        };
        {
            let mut st = self.state.lock();
            if st.busy {
                drop(st);
                return self.fail(ClientError::validation("Analysis already running"));
            }
            st.busy = true;
            st.last = None;
            st.status = "Analyzing…".to_string();
        }
        let _busy = Busy(&self.state);

        let req = ApiRequest::post_multipart(
            "/api/analyze",
            vec![FormPart::File {
                name: "rbac".to_string(),
                file_name: file.file_name.clone(),
                bytes: file.bytes.clone(),
            }],
        )
        .query("dangerOnly", opts.danger_only)
        .query("namespace", opts.namespace.trim())
        .anonymous();

        let parsed = self.http.call(req).await.and_then(|body| {
            let raw = body.unwrap_or(Value::Null);
            let report: Report = serde_json::from_value(raw.clone())?;
            Ok((raw, report))
        });
        match parsed {
            Ok((raw, report)) => {
                let mut st = self.state.lock();
                st.last = Some((raw, report.clone()));
                st.status = "Done.".to_string();
                tracing::info!(subjects = report.subjects.len(), "ad-hoc analysis finished");
                Ok(report)
            }
            Err(e) => {
                tracing::warn!(error = %e, "ad-hoc analysis failed");
                self.fail(e)
            }
        }
    }

    pub fn download(&self) -> Result<ReportDownload> {
        let raw = self.state.lock().last.as_ref().map(|(raw, _)| raw.clone());
        match raw {
            Some(raw) => Ok(ReportDownload {
                file_name: "rbac-report.json".to_string(),
                bytes: serde_json::to_vec_pretty(&raw)?,
            }),
            None => self.fail(ClientError::validation("Run an analysis first")),
        }
    }
}
