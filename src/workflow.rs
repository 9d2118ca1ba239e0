//! Cluster -> scan history -> report state machine.
//!
//! State lives behind a mutex that is never held across a request, so other
//! operations stay usable while one is in flight. Each response handler
//! re-checks the session epoch and the current selection before touching
//! state; answers that no longer match are dropped.

use parking_lot::{Mutex, MutexGuard};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{ClientError, Result};
use crate::http::{ApiRequest, FormPart, HttpClient};
use crate::models::{ManifestFile, Report, ScanRecord, ScanSummary, UploadResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowPhase {
    NoCluster,
    ClusterSelected,
    HistoryLoaded,
    ScanSelected,
    ReportLoaded,
}

/// Status lines, one per panel. A failure in one never overwrites another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PanelStatus {
    pub cluster: String,
    pub scan: String,
    pub report: String,
}

/// The last loaded report, tagged with the scan it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedReport {
    pub scan_id: String,
    /// Exactly what the server sent; downloads serialise this.
    pub raw: Value,
    pub report: Report,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRow {
    pub scan: ScanRecord,
    pub selected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportText {
    pub text: String,
    pub expanded: bool,
    /// Lines left out by the collapsed view.
    pub hidden_lines: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportDownload {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Fetched,
    /// Served from the cached report, no request made.
    Cached,
    /// Response arrived after the selection or session moved on.
    Discarded,
}

#[derive(Deserialize)]
struct ScanList {
    #[serde(default)]
    scans: Vec<ScanRecord>,
}

#[derive(Default)]
struct WorkflowState {
    epoch: u64,
    cluster_id: Option<String>,
    /// `None` until history has been loaded for the active cluster.
    history: Option<Vec<ScanRecord>>,
    selected_scan: Option<String>,
    report: Option<CachedReport>,
    expanded: bool,
    uploading: bool,
    report_in_flight: Option<String>,
    summary: Option<ScanSummary>,
    status: PanelStatus,
}

impl WorkflowState {
    fn fresh(epoch: u64) -> Self {
        Self {
            epoch,
            ..Default::default()
        }
    }

    /// Single place where the selection changes. A report tagged for any
    /// other scan is dropped here.
    fn select(&mut self, next: Option<String>) {
        let stale = matches!(&self.report, Some(r) if Some(&r.scan_id) != next.as_ref());
        if stale {
            self.report = None;
            self.expanded = false;
        }
        self.selected_scan = next;
    }

    fn apply_history(&mut self, scans: Vec<ScanRecord>) {
        // Keep a still-listed selection, otherwise default to the newest row
        let keep = self
            .selected_scan
            .clone()
            .filter(|id| scans.iter().any(|s| &s.id == id));
        let next = keep.or_else(|| scans.first().map(|s| s.id.clone()));
        self.select(next);
        self.history = Some(scans);
    }

    fn in_history(&self, scan_id: &str) -> bool {
        self.history
            .as_ref()
            .is_some_and(|h| h.iter().any(|s| s.id == scan_id))
    }
}

enum Flight {
    Upload,
    Report(String),
}

/// Re-enables a control when its request settles, however the future ends.
struct InFlight<'a> {
    state: &'a Mutex<WorkflowState>,
    epoch: u64,
    flight: Flight,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut st = self.state.lock();
        if st.epoch != self.epoch {
            return;
        }
        match &self.flight {
            Flight::Upload => st.uploading = false,
            Flight::Report(id) => {
                if st.report_in_flight.as_deref() == Some(id.as_str()) {
                    st.report_in_flight = None;
                }
            }
        }
    }
}

pub struct ScanWorkflow {
    http: HttpClient,
    report_lines: usize,
    state: Mutex<WorkflowState>,
}

impl ScanWorkflow {
    pub fn new(http: HttpClient, report_lines: usize) -> Self {
        let epoch = http.session().epoch();
        Self {
            http,
            report_lines: report_lines.max(1),
            state: Mutex::new(WorkflowState::fresh(epoch)),
        }
    }

    /// Locks state, first discarding everything if the session changed.
    fn state(&self) -> MutexGuard<'_, WorkflowState> {
        let epoch = self.http.session().epoch();
        let mut st = self.state.lock();
        if st.epoch != epoch {
            tracing::debug!(old = st.epoch, new = epoch, "session changed, workflow reset");
            *st = WorkflowState::fresh(epoch);
        }
        st
    }

    fn reject<T>(&self, panel: fn(&mut PanelStatus) -> &mut String, msg: &str) -> Result<T> {
        let err = ClientError::validation(msg);
        *panel(&mut self.state().status) = err.to_string();
        Err(err)
    }

    // ---- read side ----

    pub fn phase(&self) -> WorkflowPhase {
        let st = self.state();
        match (&st.cluster_id, &st.history, &st.selected_scan, &st.report) {
            (None, ..) => WorkflowPhase::NoCluster,
            (Some(_), None, ..) => WorkflowPhase::ClusterSelected,
            (Some(_), Some(_), None, _) => WorkflowPhase::HistoryLoaded,
            (Some(_), Some(_), Some(_), None) => WorkflowPhase::ScanSelected,
            (Some(_), Some(_), Some(_), Some(_)) => WorkflowPhase::ReportLoaded,
        }
    }

    pub fn cluster_id(&self) -> Option<String> {
        self.state().cluster_id.clone()
    }

    pub fn selected_scan(&self) -> Option<String> {
        self.state().selected_scan.clone()
    }

    /// History rows in server order, with the selection marked.
    pub fn history(&self) -> Vec<HistoryRow> {
        let st = self.state();
        st.history
            .iter()
            .flatten()
            .map(|scan| HistoryRow {
                selected: st.selected_scan.as_deref() == Some(scan.id.as_str()),
                scan: scan.clone(),
            })
            .collect()
    }

    pub fn history_meta(&self) -> String {
        match &self.state().history {
            Some(h) if h.is_empty() => "No scans yet".to_string(),
            Some(h) => format!("{} scan(s)", h.len()),
            None => String::new(),
        }
    }

    pub fn cached_report(&self) -> Option<CachedReport> {
        self.state().report.clone()
    }

    pub fn summary(&self) -> Option<ScanSummary> {
        self.state().summary.clone()
    }

    pub fn clear_summary(&self) {
        self.state().summary = None;
    }

    pub fn status(&self) -> PanelStatus {
        self.state().status.clone()
    }

    pub fn is_uploading(&self) -> bool {
        self.state().uploading
    }

    pub fn is_report_loading(&self) -> bool {
        self.state().report_in_flight.is_some()
    }

    // ---- transitions ----

    pub async fn select_cluster(&self, cluster_id: &str) -> Result<LoadOutcome> {
        let cluster_id = cluster_id.trim();
        if cluster_id.is_empty() {
            return self.reject(|s| &mut s.cluster, "Select cluster first");
        }
        {
            let mut st = self.state();
            if st.cluster_id.as_deref() != Some(cluster_id) {
                let epoch = st.epoch;
                *st = WorkflowState {
                    cluster_id: Some(cluster_id.to_string()),
                    status: std::mem::take(&mut st.status),
                    ..WorkflowState::fresh(epoch)
                };
                st.status.scan.clear();
                st.status.report.clear();
            }
            st.status.cluster.clear();
        }
        tracing::info!(%cluster_id, "cluster selected");
        self.load_history().await
    }

    pub async fn load_history(&self) -> Result<LoadOutcome> {
        let (epoch, cluster_id) = {
            let mut st = self.state();
            let Some(cluster_id) = st.cluster_id.clone() else {
                drop(st);
                return self.reject(|s| &mut s.scan, "Select cluster first");
            };
            st.status.scan.clear();
            (st.epoch, cluster_id)
        };

        let res = self
            .http
            .call_json::<ScanList>(ApiRequest::get("/api/app/scans").query("clusterId", &cluster_id))
            .await;

        let mut st = self.state();
        if st.epoch != epoch || st.cluster_id.as_deref() != Some(cluster_id.as_str()) {
            tracing::debug!(%cluster_id, "history for a deselected cluster dropped");
            return Ok(LoadOutcome::Discarded);
        }
        match res {
            Ok(list) => {
                tracing::debug!(%cluster_id, count = list.scans.len(), "history loaded");
                st.apply_history(list.scans);
                Ok(LoadOutcome::Fetched)
            }
            Err(e) => {
                st.status.scan = e.to_string();
                Err(e)
            }
        }
    }

    /// Only rows of the loaded history can be selected.
    pub fn select_scan(&self, scan_id: &str) -> Result<()> {
        let scan_id = scan_id.trim();
        let mut st = self.state();
        if st.history.is_none() {
            drop(st);
            return self.reject(|s| &mut s.scan, "Load scan history first");
        }
        if !st.in_history(scan_id) {
            drop(st);
            return self.reject(|s| &mut s.scan, &format!("Scan {scan_id} is not in this cluster's history"));
        }
        st.select(Some(scan_id.to_string()));
        tracing::debug!(%scan_id, "scan selected");
        Ok(())
    }

    pub async fn upload_scan(&self, file: Option<&ManifestFile>) -> Result<ScanRecord> {
        let file = match file {
            Some(f) if !f.is_empty() => f,
            _ => return self.reject(|s| &mut s.scan, "Choose RBAC YAML file"),
        };

        let (epoch, cluster_id) = {
            let mut st = self.state();
            let Some(cluster_id) = st.cluster_id.clone() else {
                drop(st);
                return self.reject(|s| &mut s.scan, "Select cluster first");
            };
            if st.uploading {
                drop(st);
                return self.reject(|s| &mut s.scan, "Upload already in progress");
            }
            st.uploading = true;
            st.status.scan = "Uploading & analyzing…".to_string();
            (st.epoch, cluster_id)
        };
        let _flight = InFlight {
            state: &self.state,
            epoch,
            flight: Flight::Upload,
        };

        let req = ApiRequest::post_multipart(
            "/api/app/scans",
            vec![
                FormPart::Text {
                    name: "clusterId".to_string(),
                    value: cluster_id.clone(),
                },
                FormPart::File {
                    name: "rbac".to_string(),
                    file_name: file.file_name.clone(),
                    bytes: file.bytes.clone(),
                },
            ],
        );
        let res = self.http.call_json::<UploadResponse>(req).await;

        let uploaded = {
            let mut st = self.state();
            let relevant = st.epoch == epoch && st.cluster_id.as_deref() == Some(cluster_id.as_str());
            match res {
                Err(e) => {
                    if relevant {
                        st.status.scan = e.to_string();
                    }
                    tracing::warn!(%cluster_id, error = %e, "upload failed");
                    return Err(e);
                }
                Ok(resp) if relevant => {
                    st.summary = resp.summary;
                    resp.scan
                }
                Ok(resp) => return Ok(resp.scan),
            }
        };
        tracing::info!(scan_id = %uploaded.id, %cluster_id, "scan uploaded");

        let refreshed = self.load_history().await;

        let mut st = self.state();
        if st.epoch != epoch || st.cluster_id.as_deref() != Some(cluster_id.as_str()) {
            return Ok(uploaded);
        }
        if refreshed.is_err() || !st.in_history(&uploaded.id) {
            // Server order is newest first
            let history = st.history.get_or_insert_with(Vec::new);
            if !history.iter().any(|s| s.id == uploaded.id) {
                history.insert(0, uploaded.clone());
            }
        }
        st.select(Some(uploaded.id.clone()));
        // set last: the history refresh clears the panel
        st.status.scan = "Scan uploaded".to_string();
        Ok(uploaded)
    }

    pub async fn load_report(&self) -> Result<LoadOutcome> {
        let (epoch, scan_id) = {
            let mut st = self.state();
            let Some(scan_id) = st.selected_scan.clone() else {
                drop(st);
                return self.reject(|s| &mut s.report, "Select scan from history first");
            };
            if matches!(&st.report, Some(r) if r.scan_id == scan_id) {
                return Ok(LoadOutcome::Cached);
            }
            if st.report_in_flight.as_deref() == Some(scan_id.as_str()) {
                drop(st);
                return self.reject(|s| &mut s.report, "Report is already loading");
            }
            st.report_in_flight = Some(scan_id.clone());
            st.status.report = "Loading report…".to_string();
            (st.epoch, scan_id)
        };
        let _flight = InFlight {
            state: &self.state,
            epoch,
            flight: Flight::Report(scan_id.clone()),
        };

        let res = self
            .http
            .call(ApiRequest::get("/api/app/scan/report").query("scanId", &scan_id))
            .await;

        let mut st = self.state();
        if st.epoch != epoch || st.selected_scan.as_deref() != Some(scan_id.as_str()) {
            tracing::debug!(%scan_id, "report for a deselected scan dropped");
            return Ok(LoadOutcome::Discarded);
        }

        let parsed = res.and_then(|body| {
            let body = body.ok_or_else(|| ClientError::Server {
                status: 204,
                message: "report response was empty".to_string(),
            })?;
            let raw = match body.get("report") {
                Some(r) => r.clone(),
                None => body,
            };
            let report: Report = serde_json::from_value(raw.clone())?;
            Ok((raw, report))
        });
        match parsed {
            Ok((raw, report)) => {
                st.report = Some(CachedReport {
                    scan_id: scan_id.clone(),
                    raw,
                    report,
                });
                st.expanded = false;
                st.status.report = "Report loaded".to_string();
                tracing::info!(%scan_id, "report loaded");
                Ok(LoadOutcome::Fetched)
            }
            Err(e) => {
                st.status.report = e.to_string();
                Err(e)
            }
        }
    }

    /// Select the newest scan and load its report.
    pub async fn load_latest_report(&self) -> Result<LoadOutcome> {
        {
            let mut st = self.state();
            let latest = st.history.as_ref().and_then(|h| h.first()).map(|s| s.id.clone());
            match latest {
                Some(id) => st.select(Some(id)),
                None => {
                    drop(st);
                    return self.reject(|s| &mut s.report, "No scans yet");
                }
            }
        }
        self.load_report().await
    }

    /// Flip collapsed/expanded. Presentation only.
    pub fn toggle_report_expansion(&self) -> bool {
        let mut st = self.state();
        st.expanded = !st.expanded;
        st.expanded
    }

    pub fn report_text(&self) -> Option<ReportText> {
        let (raw, expanded) = {
            let st = self.state();
            (st.report.as_ref()?.raw.clone(), st.expanded)
        };
        let full = serde_json::to_string_pretty(&raw).ok()?;
        Some(collapse(&full, expanded, self.report_lines))
    }

    pub fn download_report(&self) -> Result<ReportDownload> {
        let cached = self.state().report.clone();
        let Some(cached) = cached else {
            return self.reject(|s| &mut s.report, "Load report first");
        };
        Ok(ReportDownload {
            file_name: format!("rbac-report-{}.json", cached.scan_id),
            bytes: serde_json::to_vec_pretty(&cached.raw)?,
        })
    }
}

/// Collapsed view keeps the first `max_lines` lines and says how many are hidden.
pub fn collapse(full: &str, expanded: bool, max_lines: usize) -> ReportText {
    let lines: Vec<&str> = full.split('\n').collect();
    if expanded || lines.len() <= max_lines {
        return ReportText {
            text: full.to_string(),
            expanded,
            hidden_lines: 0,
        };
    }
    let hidden = lines.len() - max_lines;
    ReportText {
        text: format!(
            "{}\n\n… ({} more lines hidden. Press Toggle)",
            lines[..max_lines].join("\n"),
            hidden
        ),
        expanded,
        hidden_lines: hidden,
    }
}
