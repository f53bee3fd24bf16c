//! Step table, CSV and report files

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::info;

use crate::driver::{StepHistory, StepResult};
use crate::error::{DriverError, Result};

const BANNER: &str = "═══════════════════════════════════════════════════════════════";

const BASE_COLUMNS: [&str; 10] = [
    "CONCURRENCY",
    "REQUESTS",
    "SUCC_REQS",
    "FAIL_REQS",
    "RESP_MISMATCH",
    "SUCC_REQS_RATE(REQ/S)",
    "READ_TP(B/S)",
    "WRITE_TP(B/S)",
    "AVE_CPU_USAGE(%)",
    "TIME(S)",
];

/// Short label of a URL: the path tail, or the port when the URL has no path.
///
/// `http://10.0.0.5:8070/ocr` gives `ocr`, `http://10.0.0.5:8073/` gives `8073`.
pub fn service_name(url: &str) -> String {
    let url = url.trim();
    let url = url.strip_suffix('/').unwrap_or(url);
    let slash = url.rfind('/');
    let colon = url.rfind(':');
    let start = match (slash, colon) {
        (Some(s), Some(c)) if c > s => c + 1,
        (Some(s), _) => s + 1,
        (None, Some(c)) => c + 1,
        (None, None) => 0,
    };
    url[start..].to_string()
}

/// Name used in report file names: the URL file stem, else the service name
pub fn run_title(url: Option<&str>, file: Option<&Path>) -> String {
    if let Some(stem) = file.and_then(|f| f.file_stem()).and_then(|s| s.to_str()) {
        return stem.to_string();
    }
    url.map(service_name).unwrap_or_default()
}

/// One report column per distinct URL
struct ServiceColumn {
    url: String,
    label: String,
    has_apdex: bool,
}

fn service_columns(history: &StepHistory) -> Vec<ServiceColumn> {
    history
        .services()
        .into_iter()
        .map(|(url, service)| ServiceColumn {
            has_apdex: history
                .steps
                .iter()
                .flat_map(|s| &s.urls)
                .any(|u| u.url == url && u.apdex.is_some()),
            label: service.to_uppercase(),
            url,
        })
        .collect()
}

fn base_cells(step: &StepResult) -> Vec<String> {
    let c = &step.counters;
    vec![
        step.concurrency.to_string(),
        c.requests.to_string(),
        c.successes.to_string(),
        (c.network_failed + c.bad_failed).to_string(),
        c.mismatched.to_string(),
        format!("{:.2}", step.rate),
        step.read_throughput.to_string(),
        step.write_throughput.to_string(),
        step.cpu_percent.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string()),
        step.elapsed_secs.to_string(),
    ]
}

fn format_apdex(score: Option<f64>) -> String {
    score.map(|s| format!("{:.5}", s)).unwrap_or_default()
}

/// Caption naming the step with the most successful requests
pub fn best_caption(history: &StepHistory) -> Option<String> {
    let best = history.best_step().filter(|s| s.rate > 0.0)?;
    let p95 = best.primary()?.p95();
    Some(format!(
        "Best throughput found at {:.2} requests per second with 95th percentile latency of {} ms",
        best.rate, p95
    ))
}

/// Aligned step table
pub fn render_table(history: &StepHistory) -> String {
    let columns = service_columns(history);
    let multi = columns.len() > 1;

    let mut header: Vec<String> = BASE_COLUMNS.iter().map(|c| c.to_string()).collect();
    for col in &columns {
        header.push(format!("{}_RESP_TIME(95%ile)(MS)", col.label));
        if col.has_apdex {
            header.push(format!("{}_APDEX", col.label));
        }
    }

    let mut rows = vec![header];
    for step in &history.steps {
        let mut row = base_cells(step);
        for col in &columns {
            let stat = step.urls.iter().find(|u| u.url == col.url);
            row.push(match stat {
                Some(u) if multi => format!("{} {}", u.p95(), u.total),
                Some(u) => u.p95().to_string(),
                None => "-".to_string(),
            });
            if col.has_apdex {
                row.push(format_apdex(stat.and_then(|u| u.apdex)));
            }
        }
        rows.push(row);
    }

    let widths: Vec<usize> = (0..rows[0].len())
        .map(|i| rows.iter().map(|r| r[i].chars().count()).max().unwrap_or(0))
        .collect();

    let mut out = String::new();
    for row in &rows {
        let line: Vec<String> = row
            .iter()
            .zip(&widths)
            .map(|(cell, w)| format!("{:<w$}", cell, w = *w))
            .collect();
        let _ = writeln!(out, "  {}", line.join("  ").trim_end());
    }
    if let Some(caption) = best_caption(history) {
        let _ = writeln!(out, "{}", caption);
    }
    let _ = writeln!(out, "Stopped: {}", history.stop_reason);
    out
}

/// Same columns as the table, plus per-URL request counts for multi-URL runs
pub fn render_csv(history: &StepHistory) -> String {
    let columns = service_columns(history);
    let multi = columns.len() > 1;

    let mut header: Vec<String> = BASE_COLUMNS.iter().map(|c| c.to_string()).collect();
    for col in &columns {
        if multi {
            header.push(format!("{}_REQS", col.label));
        }
        header.push(format!("{}_RESP_TIME(95%ile)(MS)", col.label));
        if col.has_apdex {
            header.push(format!("{}_APDEX", col.label));
        }
    }

    let mut out = String::new();
    let _ = writeln!(out, "{}", header.join(","));
    for step in &history.steps {
        let mut row = base_cells(step);
        row[8] = step.cpu_percent.map(|v| v.to_string()).unwrap_or_default();
        for col in &columns {
            let stat = step.urls.iter().find(|u| u.url == col.url);
            if multi {
                row.push(stat.map(|u| u.total.to_string()).unwrap_or_default());
            }
            row.push(stat.map(|u| u.p95().to_string()).unwrap_or_default());
            if col.has_apdex {
                row.push(format_apdex(stat.and_then(|u| u.apdex)));
            }
        }
        let _ = writeln!(out, "{}", row.join(","));
    }
    out
}

/// Per-step counter blocks followed by the total time
pub fn render_summary(history: &StepHistory) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\n{}", BANNER);
    let _ = writeln!(out, "  RESULTS SUMMARY");
    let _ = writeln!(out, "{}", BANNER);
    for step in &history.steps {
        let c = &step.counters;
        let _ = writeln!(out, "  Clients:                    {:>10} clts", step.concurrency);
        let _ = writeln!(out, "  Requests:                   {:>10} hits", c.requests);
        let _ = writeln!(out, "  Successful requests:        {:>10} hits", c.successes);
        let _ = writeln!(out, "  Network failed:             {:>10} hits", c.network_failed);
        let _ = writeln!(out, "  Bad requests failed (!2xx): {:>10} hits", c.bad_failed);
        let _ = writeln!(out, "  Pattern mismatch:           {:>10} hits", c.mismatched);
        let _ = writeln!(out, "  Successful requests rate:   {:>10.2} hits/sec", step.rate);
        let _ = writeln!(out, "  Read throughput:            {:>10} bytes/sec", step.read_throughput);
        let _ = writeln!(out, "  Write throughput:           {:>10} bytes/sec", step.write_throughput);
        if let Some(cpu) = step.cpu_percent {
            let _ = writeln!(out, "  Average CPU usage:          {:>10} %", cpu);
        }
        let _ = writeln!(out, "{}", BANNER);
    }
    let _ = writeln!(out, "  Total test time:            {:>10} sec", history.total_secs.max(1));
    out
}

/// Files written for one drive
#[derive(Debug, Clone)]
pub struct ReportPaths {
    pub log: PathBuf,
    pub csv: PathBuf,
    pub json: Option<PathBuf>,
}

/// Writes `<dir>/loadstep_<title>_<YYYYMMDD_HHMMSS>.{log,csv,json}`
#[derive(Debug, Clone)]
pub struct ReportWriter {
    dir: PathBuf,
    title: String,
    stamp: String,
}

impl ReportWriter {
    pub fn new(dir: impl Into<PathBuf>, title: &str) -> Self {
        Self {
            dir: dir.into(),
            title: title.to_string(),
            stamp: Local::now().format("%Y%m%d_%H%M%S").to_string(),
        }
    }

    pub fn path(&self, ext: &str) -> PathBuf {
        self.dir
            .join(format!("loadstep_{}_{}.{}", self.title, self.stamp, ext))
    }

    fn write_file(path: &Path, content: &str) -> Result<()> {
        std::fs::write(path, content).map_err(|source| DriverError::Report {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn write(&self, history: &StepHistory, json: bool) -> Result<ReportPaths> {
        std::fs::create_dir_all(&self.dir).map_err(|source| DriverError::Report {
            path: self.dir.clone(),
            source,
        })?;

        let log = self.path("log");
        let mut text = render_summary(history);
        text.push('\n');
        text.push_str(&render_table(history));
        Self::write_file(&log, &text)?;

        let csv = self.path("csv");
        Self::write_file(&csv, &render_csv(history))?;

        let json = if json {
            let path = self.path("json");
            Self::write_file(&path, &serde_json::to_string_pretty(history)?)?;
            Some(path)
        } else {
            None
        };

        info!("Results saved to {}", log.display());
        Ok(ReportPaths { log, csv, json })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{StopReason, UrlStepStat};
    use loadstep_gen::RunResult;

    fn stat(url: &str, total: u64, p95: u64, apdex: Option<f64>) -> UrlStepStat {
        UrlStepStat {
            service: service_name(url),
            url: url.to_string(),
            total,
            percentiles: [p95 / 4, p95 / 3, p95 / 2, p95 / 2, p95, p95, p95 + 5],
            apdex,
        }
    }

    fn step(concurrency: usize, successes: u64, urls: Vec<UrlStepStat>) -> StepResult {
        StepResult {
            concurrency,
            counters: RunResult {
                requests: successes + 3,
                successes,
                network_failed: 1,
                bad_failed: 1,
                mismatched: 1,
            },
            rate: successes as f64 / 120.0,
            read_throughput: 1000,
            write_throughput: 200,
            cpu_percent: Some(35),
            elapsed_secs: 120,
            urls,
        }
    }

    fn history(steps: Vec<StepResult>) -> StepHistory {
        StepHistory {
            steps,
            stop_reason: StopReason::Plateau,
            started_at: Local::now(),
            total_secs: 240,
        }
    }

    #[test]
    fn test_service_name() {
        assert_eq!(service_name("http://10.0.0.5:8070/ocr"), "ocr");
        assert_eq!(service_name("  http://10.0.0.5:8073/ "), "8073");
        assert_eq!(service_name("http://10.0.0.5:8073"), "8073");
        assert_eq!(service_name("https://svc/api/v1/login"), "login");
    }

    #[test]
    fn test_run_title() {
        assert_eq!(
            run_title(Some("http://h:8070/ocr"), Some(Path::new("conf/urls.txt"))),
            "urls"
        );
        assert_eq!(run_title(Some("http://h:8070/ocr"), None), "ocr");
        assert_eq!(run_title(None, None), "");
    }

    #[test]
    fn test_single_url_table() {
        let h = history(vec![
            step(100, 1200, vec![stat("http://h:8070/ocr", 1203, 80, Some(0.9))]),
            step(200, 2400, vec![stat("http://h:8070/ocr", 2403, 150, Some(0.75))]),
        ]);
        let table = render_table(&h);
        let lines: Vec<&str> = table.lines().collect();

        assert!(lines[0].contains("CONCURRENCY"));
        assert!(lines[0].contains("OCR_RESP_TIME(95%ile)(MS)"));
        assert!(lines[0].contains("OCR_APDEX"));
        assert!(lines[2].trim_start().starts_with("200"));
        assert!(lines[2].contains("0.75000"));
        assert_eq!(
            lines[3],
            "Best throughput found at 20.00 requests per second with 95th percentile latency of 150 ms"
        );
        assert!(lines[4].starts_with("Stopped: Plateau"));
    }

    #[test]
    fn test_csv_columns() {
        let h = history(vec![step(
            100,
            600,
            vec![
                stat("http://h:8070/ocr", 400, 80, None),
                stat("http://h:8071", 203, 20, None),
            ],
        )]);
        let csv = render_csv(&h);
        let mut lines = csv.lines();
        assert_eq!(
            lines.next().unwrap(),
            "CONCURRENCY,REQUESTS,SUCC_REQS,FAIL_REQS,RESP_MISMATCH,SUCC_REQS_RATE(REQ/S),\
READ_TP(B/S),WRITE_TP(B/S),AVE_CPU_USAGE(%),TIME(S),OCR_REQS,OCR_RESP_TIME(95%ile)(MS),\
8071_REQS,8071_RESP_TIME(95%ile)(MS)"
        );
        assert_eq!(
            lines.next().unwrap(),
            "100,603,600,2,1,5.00,1000,200,35,120,400,80,203,20"
        );
        assert!(lines.next().is_none());

        // Multi-URL table cells carry the request count next to the latency
        assert!(render_table(&h).contains("80 400"));
    }

    #[test]
    fn test_no_caption_without_throughput() {
        let h = history(vec![step(100, 0, vec![])]);
        assert!(best_caption(&h).is_none());
        assert!(!render_table(&h).contains("Best throughput"));
    }

    #[test]
    fn test_writer_creates_files() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("output");
        let writer = ReportWriter::new(&out, "ocr");
        let h = history(vec![step(100, 1200, vec![stat("http://h:8070/ocr", 1203, 80, None)])]);

        let paths = writer.write(&h, true).unwrap();
        let name = paths.log.file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with("loadstep_ocr_"));
        assert!(name.ends_with(".log"));
        // loadstep_ocr_YYYYMMDD_HHMMSS.log
        assert_eq!(name.len(), "loadstep_ocr_".len() + 15 + 4);

        let log = std::fs::read_to_string(&paths.log).unwrap();
        assert!(log.contains("RESULTS SUMMARY"));
        assert!(log.contains("CONCURRENCY"));
        assert!(std::fs::read_to_string(&paths.csv).unwrap().starts_with("CONCURRENCY,"));

        let json = std::fs::read_to_string(paths.json.unwrap()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["stop_reason"]["reason"], "plateau");
        assert_eq!(parsed["steps"][0]["concurrency"], 100);
    }
}
