//! Text form of a [`RunSummary`]
//!
//! The generator prints this block when a run ends, and saved copies can be
//! parsed back into a summary. Counter lines are `<label>: <value> <unit>`;
//! each URL block starts with the `For URL:` marker.

use std::fmt;

use crate::config::ApdexThreshold;
use crate::error::{LoadGenError, Result};
use crate::stats::{ApdexScore, RunSummary, UrlLatencyReport, PERCENTILES};

const REQUESTS: &str = "Requests:";
const SUCCESSES: &str = "Successful requests:";
const NETWORK_FAILED: &str = "Network failed:";
const BAD_FAILED: &str = "Bad requests failed (!2xx):";
const MISMATCHED: &str = "Pattern mismatch:";
const RATE: &str = "Successful requests rate:";
const READ_TP: &str = "Read throughput:";
const WRITE_TP: &str = "Write throughput:";
const TEST_TIME: &str = "Test time:";
const URL_MARKER: &str = "For URL:";
const THRESHOLD: &str = "For time threshold values [";
const SATISFIED: &str = "Satisfied requests count:";
const TOLERATED: &str = "Tolerated requests count:";
const FRUSTRATED: &str = "Frustrated requests count:";
const APDEX: &str = "Apdex score is:";

fn row(f: &mut fmt::Formatter<'_>, label: &str, value: impl fmt::Display, unit: &str) -> fmt::Result {
    writeln!(f, "{:<32}{:>10} {}", label, value, unit)
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.counters;
        writeln!(f)?;
        row(f, REQUESTS, c.requests, "hits")?;
        row(f, SUCCESSES, c.successes, "hits")?;
        row(f, NETWORK_FAILED, c.network_failed, "hits")?;
        row(f, BAD_FAILED, c.bad_failed, "hits")?;
        row(f, MISMATCHED, c.mismatched, "hits")?;
        row(f, RATE, format!("{:.2}", self.rate), "hits/sec")?;
        row(f, READ_TP, self.read_throughput, "bytes/sec")?;
        row(f, WRITE_TP, self.write_throughput, "bytes/sec")?;
        row(f, TEST_TIME, self.elapsed_secs, "sec")?;

        writeln!(f, "\nPercentage of the requests served within a certain time (ms)")?;
        for url in &self.urls {
            writeln!(f, "{} {}", URL_MARKER, url.url)?;
            writeln!(f, "Total {} responses are received", url.total)?;
            for (p, v) in PERCENTILES.iter().zip(url.percentiles) {
                writeln!(f, "{:>3}% {:>10}", p, v)?;
            }
            if let Some(apdex) = &url.apdex {
                writeln!(
                    f,
                    "\n{}{}:{}ms]",
                    THRESHOLD, apdex.threshold.satisfied_ms, apdex.threshold.tolerated_ms
                )?;
                writeln!(f, "{:<27}{:>10}", SATISFIED, apdex.satisfied)?;
                writeln!(f, "{:<27}{:>10}", TOLERATED, apdex.tolerated)?;
                writeln!(f, "{:<27}{:>10}", FRUSTRATED, apdex.frustrated)?;
                writeln!(f, "{} {:.5}\n", APDEX, apdex.score)?;
            }
        }
        Ok(())
    }
}

/// Per-URL block being assembled while parsing
#[derive(Default)]
struct UrlBlock {
    report: Option<UrlLatencyReport>,
    threshold: Option<ApdexThreshold>,
    buckets: [u64; 3],
}

impl UrlBlock {
    fn finish(&mut self, urls: &mut Vec<UrlLatencyReport>) {
        if let Some(report) = self.report.take() {
            urls.push(report);
        }
        self.threshold = None;
        self.buckets = [0; 3];
    }
}

fn first_token<T: std::str::FromStr>(rest: &str, line: usize) -> Result<T> {
    let token = rest.split_whitespace().next().unwrap_or("");
    token.parse().map_err(|_| LoadGenError::InvalidSummary {
        line,
        message: format!("cannot parse value '{}'", token),
    })
}

fn current<'a>(block: &'a mut UrlBlock, line: usize) -> Result<&'a mut UrlLatencyReport> {
    block.report.as_mut().ok_or(LoadGenError::InvalidSummary {
        line,
        message: format!("URL statistics before a '{}' line", URL_MARKER),
    })
}

/// Parse a percentile line such as ` 95%        120`
fn percentile_line(line: &str) -> Option<(usize, &str)> {
    let (p, rest) = line.split_once('%')?;
    let p: u32 = p.trim().parse().ok()?;
    let idx = PERCENTILES.iter().position(|&x| x == p)?;
    Some((idx, rest))
}

/// Parse the text produced by `RunSummary`'s `Display` impl
pub fn parse_summary(text: &str) -> Result<RunSummary> {
    let mut summary = RunSummary::default();
    let mut block = UrlBlock::default();
    let mut saw_requests = false;

    for (idx, raw) in text.lines().enumerate() {
        let n = idx + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(url) = line.strip_prefix(URL_MARKER) {
            block.finish(&mut summary.urls);
            block.report = Some(UrlLatencyReport {
                url: url.trim().to_string(),
                total: 0,
                percentiles: [0; 7],
                apdex: None,
            });
        } else if let Some(rest) = line.strip_prefix("Total ") {
            current(&mut block, n)?.total = first_token(rest, n)?;
        } else if let Some((p, rest)) = percentile_line(line) {
            current(&mut block, n)?.percentiles[p] = first_token(rest, n)?;
        } else if let Some(rest) = line.strip_prefix(THRESHOLD) {
            let pair = rest.trim_end_matches(']').trim_end_matches("ms");
            block.threshold = Some(pair.parse().map_err(|_| LoadGenError::InvalidSummary {
                line: n,
                message: format!("invalid threshold '{}'", pair),
            })?);
        } else if let Some(rest) = line.strip_prefix(SATISFIED) {
            block.buckets[0] = first_token(rest, n)?;
        } else if let Some(rest) = line.strip_prefix(TOLERATED) {
            block.buckets[1] = first_token(rest, n)?;
        } else if let Some(rest) = line.strip_prefix(FRUSTRATED) {
            block.buckets[2] = first_token(rest, n)?;
        } else if let Some(rest) = line.strip_prefix(APDEX) {
            let score: f64 = first_token(rest, n)?;
            let threshold = block.threshold.ok_or(LoadGenError::InvalidSummary {
                line: n,
                message: "Apdex score without thresholds".to_string(),
            })?;
            let [satisfied, tolerated, frustrated] = block.buckets;
            current(&mut block, n)?.apdex = Some(ApdexScore {
                threshold,
                satisfied,
                tolerated,
                frustrated,
                score,
            });
        } else if let Some(rest) = line.strip_prefix(RATE) {
            summary.rate = first_token(rest, n)?;
        } else if let Some(rest) = line.strip_prefix(SUCCESSES) {
            summary.counters.successes = first_token(rest, n)?;
        } else if let Some(rest) = line.strip_prefix(REQUESTS) {
            summary.counters.requests = first_token(rest, n)?;
            saw_requests = true;
        } else if let Some(rest) = line.strip_prefix(NETWORK_FAILED) {
            summary.counters.network_failed = first_token(rest, n)?;
        } else if let Some(rest) = line.strip_prefix(BAD_FAILED) {
            summary.counters.bad_failed = first_token(rest, n)?;
        } else if let Some(rest) = line.strip_prefix(MISMATCHED) {
            summary.counters.mismatched = first_token(rest, n)?;
        } else if let Some(rest) = line.strip_prefix(READ_TP) {
            summary.read_throughput = first_token(rest, n)?;
        } else if let Some(rest) = line.strip_prefix(WRITE_TP) {
            summary.write_throughput = first_token(rest, n)?;
        } else if let Some(rest) = line.strip_prefix(TEST_TIME) {
            summary.elapsed_secs = first_token(rest, n)?;
        }
    }
    block.finish(&mut summary.urls);

    if !saw_requests {
        return Err(LoadGenError::InvalidSummary {
            line: 0,
            message: format!("no '{}' line found", REQUESTS),
        });
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::RunResult;

    fn synthetic() -> RunSummary {
        RunSummary {
            counters: RunResult {
                requests: 1200,
                successes: 1100,
                network_failed: 40,
                bad_failed: 35,
                mismatched: 25,
            },
            elapsed_secs: 60,
            rate: 18.33,
            read_throughput: 52_000,
            write_throughput: 9_100,
            urls: vec![
                UrlLatencyReport {
                    url: "http://10.0.0.5:8070/ocr".to_string(),
                    total: 800,
                    percentiles: [12, 14, 17, 21, 30, 41, 220],
                    apdex: Some(ApdexScore {
                        threshold: ApdexThreshold {
                            satisfied_ms: 20,
                            tolerated_ms: 80,
                        },
                        satisfied: 600,
                        tolerated: 180,
                        frustrated: 20,
                        score: 0.8625,
                    }),
                },
                UrlLatencyReport {
                    url: "http://10.0.0.5:8071".to_string(),
                    total: 400,
                    percentiles: [5, 5, 6, 6, 7, 9, 15],
                    apdex: None,
                },
            ],
            overview: None,
        }
    }

    #[test]
    fn test_round_trip() {
        let summary = synthetic();
        let text = summary.to_string();
        let parsed = parse_summary(&text).unwrap();
        assert_eq!(parsed, summary);
    }

    #[test]
    fn test_format_lines() {
        let text = synthetic().to_string();
        assert!(text.contains("Requests:                             1200 hits"));
        assert!(text.contains("Successful requests rate:            18.33 hits/sec"));
        assert!(text.contains("For URL: http://10.0.0.5:8070/ocr"));
        assert!(text.contains(" 95%         41"));
        assert!(text.contains("100%        220"));
        assert!(text.contains("Apdex score is: 0.86250"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_summary("hello\nworld\n").is_err());
        assert!(parse_summary("Requests: many hits\n").is_err());
        assert!(parse_summary("Requests: 1 hits\nTotal 5 responses are received\n").is_err());
    }

    #[test]
    fn test_parse_without_urls() {
        let summary = RunSummary {
            counters: RunResult {
                requests: 3,
                network_failed: 3,
                ..Default::default()
            },
            elapsed_secs: 1,
            ..Default::default()
        };
        let parsed = parse_summary(&summary.to_string()).unwrap();
        assert_eq!(parsed.counters, summary.counters);
        assert!(parsed.urls.is_empty());
    }
}
