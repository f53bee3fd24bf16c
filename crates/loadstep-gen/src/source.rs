//! URL source: weighted, shuffled request specifications
//!
//! A URL file is line based. `WEIGHT:<n>` sets how many copies of each
//! following line are made, until the next `WEIGHT` line. Lines before the
//! first `WEIGHT` line have weight 0 and are dropped. A line is a target URL
//! optionally followed by tags:
//!
//! ```text
//! WEIGHT:3
//! http://host:8070/ocr[EXPECT]"status":"ok"[THOLD]100:400
//! WEIGHT:1
//! http://host:8070/login[POST]user=a&pass=b
//! ```

use std::collections::BTreeMap;
use std::fmt;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{ApdexThreshold, GeneratorConfig, ShuffleMode};
use crate::error::{LoadGenError, Result};

const WEIGHT_PREFIX: &str = "WEIGHT:";
const TAG_POST: &str = "[POST]";
const TAG_EXPECT: &str = "[EXPECT]";
const TAG_THOLD: &str = "[THOLD]";

/// HTTP method of a request specification
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
        }
    }
}

/// One request the workers replay
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UrlSpec {
    /// Absolute http(s) URL; also the key of the latency table
    pub target: String,
    pub method: HttpMethod,
    pub body: Option<Vec<u8>>,
    /// Body substring a 200 response must contain to count as a success
    pub expect: Option<String>,
    pub threshold: Option<ApdexThreshold>,
}

/// Values applied to entries that do not set their own
#[derive(Clone, Debug, Default)]
pub struct EntryDefaults {
    pub expect: Option<String>,
    pub threshold: Option<ApdexThreshold>,
    /// POST body for entries without a `[POST]` tag
    pub post_body: Option<Vec<u8>>,
}

/// Parse one entry (a URL followed by optional tags)
pub fn parse_entry(line: &str, defaults: &EntryDefaults) -> Result<UrlSpec> {
    let line = line.trim();
    let tags = [TAG_POST, TAG_EXPECT, TAG_THOLD];

    let mut starts: Vec<(usize, &str)> = tags
        .iter()
        .filter_map(|tag| line.find(tag).map(|pos| (pos, *tag)))
        .collect();
    starts.sort_unstable();

    let url_end = starts.first().map(|(pos, _)| *pos).unwrap_or(line.len());
    let target = line[..url_end].trim().to_string();
    validate_url(&target)?;

    let mut spec = UrlSpec {
        target,
        method: HttpMethod::Get,
        body: None,
        expect: defaults.expect.clone(),
        threshold: defaults.threshold,
    };
    if let Some(body) = &defaults.post_body {
        spec.method = HttpMethod::Post;
        spec.body = Some(body.clone());
    }

    for (i, (pos, tag)) in starts.iter().enumerate() {
        let value_start = pos + tag.len();
        let value_end = starts.get(i + 1).map(|(next, _)| *next).unwrap_or(line.len());
        let value = &line[value_start..value_end];
        match *tag {
            TAG_POST => {
                spec.method = HttpMethod::Post;
                spec.body = Some(value.as_bytes().to_vec());
            }
            TAG_EXPECT => spec.expect = Some(value.to_string()).filter(|p| !p.is_empty()),
            TAG_THOLD => spec.threshold = Some(value.parse()?),
            _ => unreachable!("unknown tag"),
        }
    }

    Ok(spec)
}

fn validate_url(target: &str) -> Result<()> {
    let invalid = |reason: String| LoadGenError::InvalidUrl {
        url: target.to_string(),
        reason,
    };
    let parsed = reqwest::Url::parse(target).map_err(|e| invalid(e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(invalid(format!("unsupported scheme '{}'", other))),
    }
}

/// Expand the content of a URL file into its pre-shuffle list
pub fn parse_url_lines(content: &str, defaults: &EntryDefaults) -> Result<Vec<UrlSpec>> {
    let mut specs = Vec::new();
    let mut weight = 0usize;

    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(value) = line.strip_prefix(WEIGHT_PREFIX) {
            weight = value.trim().parse().map_err(|_| LoadGenError::InvalidWeight {
                line: idx + 1,
                value: value.to_string(),
            })?;
            continue;
        }

        if weight == 0 {
            debug!("Dropping line {} with weight 0: {}", idx + 1, line);
            continue;
        }

        let spec = parse_entry(line, defaults)?;
        debug!("{} is attached weight {}", spec.target, weight);
        specs.extend(std::iter::repeat(spec).take(weight));
    }

    Ok(specs)
}

/// Permute `items` in place
pub fn shuffle<T, R: Rng + ?Sized>(items: &mut [T], mode: ShuffleMode, rng: &mut R) {
    let n = items.len();
    if n < 2 {
        return;
    }
    match mode {
        ShuffleMode::Compatible => {
            for i in 0..n {
                let j = rng.gen_range(0..n);
                items.swap(i, j);
            }
        }
        ShuffleMode::Uniform => items.shuffle(rng),
    }
}

/// The shuffled request sequence replayed by the workers
#[derive(Clone, Debug)]
pub struct UrlSource {
    specs: Vec<UrlSpec>,
}

impl UrlSource {
    /// Load, expand and shuffle the configured targets
    pub fn from_config(config: &GeneratorConfig) -> Result<Self> {
        let post_body = match &config.post_data_file {
            Some(path) => Some(std::fs::read(path).map_err(|source| LoadGenError::PostData {
                path: path.clone(),
                source,
            })?),
            None => None,
        };
        let defaults = EntryDefaults {
            expect: config.expect.clone().filter(|p| !p.is_empty()),
            threshold: config.apdex,
            post_body,
        };

        let mut specs = Vec::new();
        if let Some(path) = &config.url_file {
            let content =
                std::fs::read_to_string(path).map_err(|source| LoadGenError::UrlFile {
                    path: path.clone(),
                    source,
                })?;
            specs = parse_url_lines(&content, &defaults)?;
        }
        if let Some(url) = config.url.as_deref().filter(|u| !u.trim().is_empty()) {
            specs.push(parse_entry(url, &defaults)?);
        }

        let mut source = Self::from_specs(specs)?;
        source.shuffle(config.shuffle, &mut rand::thread_rng());
        info!(
            "Loaded {} request specifications for {} distinct URLs",
            source.len(),
            source.targets().len()
        );
        Ok(source)
    }

    /// Wrap an already expanded list
    pub fn from_specs(specs: Vec<UrlSpec>) -> Result<Self> {
        if specs.is_empty() {
            return Err(LoadGenError::EmptyUrlList);
        }
        Ok(Self { specs })
    }

    pub fn shuffle<R: Rng + ?Sized>(&mut self, mode: ShuffleMode, rng: &mut R) {
        shuffle(&mut self.specs, mode, rng);
    }

    pub fn specs(&self) -> &[UrlSpec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Distinct targets in sorted order
    pub fn targets(&self) -> Vec<&str> {
        let mut targets: Vec<&str> = self.specs.iter().map(|s| s.target.as_str()).collect();
        targets.sort_unstable();
        targets.dedup();
        targets
    }

    /// Apdex thresholds keyed by target; the first entry of a target wins
    pub fn thresholds(&self) -> BTreeMap<String, ApdexThreshold> {
        let mut map = BTreeMap::new();
        for spec in &self.specs {
            if let Some(t) = spec.threshold {
                map.entry(spec.target.clone()).or_insert(t);
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::io::Write;

    fn count(specs: &[UrlSpec], target: &str) -> usize {
        specs.iter().filter(|s| s.target == target).count()
    }

    #[test]
    fn test_weight_expansion() {
        let specs = parse_url_lines("WEIGHT:3\nhttp://x/a\n", &EntryDefaults::default()).unwrap();
        assert_eq!(specs.len(), 3);
        assert!(specs.iter().all(|s| s.target == "http://x/a"));
    }

    #[test]
    fn test_mixed_weights() {
        let content = "WEIGHT:1\nhttp://x/a\nWEIGHT:2\nhttp://x/b\n";
        let specs = parse_url_lines(content, &EntryDefaults::default()).unwrap();
        assert_eq!(specs.len(), 3);
        assert_eq!(count(&specs, "http://x/a"), 1);
        assert_eq!(count(&specs, "http://x/b"), 2);
    }

    #[test]
    fn test_lines_before_first_weight_are_dropped() {
        let content = "http://x/dropped\nWEIGHT:0\nhttp://x/zero\nWEIGHT:2\nhttp://x/kept\n";
        let specs = parse_url_lines(content, &EntryDefaults::default()).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(count(&specs, "http://x/kept"), 2);
    }

    #[test]
    fn test_invalid_weight() {
        let err = parse_url_lines("WEIGHT:abc\nhttp://x/a\n", &EntryDefaults::default())
            .unwrap_err();
        assert!(matches!(err, LoadGenError::InvalidWeight { line: 1, .. }));
    }

    #[test]
    fn test_tags() {
        let spec = parse_entry(
            "http://x/login[POST]user=a&pass=b[EXPECT]welcome[THOLD]100:400",
            &EntryDefaults::default(),
        )
        .unwrap();
        assert_eq!(spec.target, "http://x/login");
        assert_eq!(spec.method, HttpMethod::Post);
        assert_eq!(spec.body.as_deref(), Some(&b"user=a&pass=b"[..]));
        assert_eq!(spec.expect.as_deref(), Some("welcome"));
        assert_eq!(
            spec.threshold,
            Some(ApdexThreshold {
                satisfied_ms: 100,
                tolerated_ms: 400
            })
        );
    }

    #[test]
    fn test_tag_order_does_not_matter() {
        let spec = parse_entry("http://x/a[THOLD]5:10[EXPECT]ok", &EntryDefaults::default())
            .unwrap();
        assert_eq!(spec.target, "http://x/a");
        assert_eq!(spec.expect.as_deref(), Some("ok"));
        assert_eq!(spec.threshold.unwrap().tolerated_ms, 10);
        assert_eq!(spec.method, HttpMethod::Get);
    }

    #[test]
    fn test_defaults_apply_to_untagged_entries() {
        let defaults = EntryDefaults {
            expect: Some("global".into()),
            threshold: None,
            post_body: Some(b"payload".to_vec()),
        };
        let spec = parse_entry("http://x/a", &defaults).unwrap();
        assert_eq!(spec.expect.as_deref(), Some("global"));
        assert_eq!(spec.method, HttpMethod::Post);
        assert_eq!(spec.body.as_deref(), Some(&b"payload"[..]));

        let spec = parse_entry("http://x/a[EXPECT]local", &defaults).unwrap();
        assert_eq!(spec.expect.as_deref(), Some("local"));
    }

    #[test]
    fn test_invalid_url_and_threshold() {
        let defaults = EntryDefaults::default();
        assert!(matches!(
            parse_entry("ftp://x/a", &defaults),
            Err(LoadGenError::InvalidUrl { .. })
        ));
        assert!(matches!(
            parse_entry("not a url", &defaults),
            Err(LoadGenError::InvalidUrl { .. })
        ));
        assert!(matches!(
            parse_entry("http://x/a[THOLD]400:100", &defaults),
            Err(LoadGenError::InvalidThreshold(_))
        ));
    }

    #[test]
    fn test_shuffle_keeps_multiset() {
        for mode in [ShuffleMode::Compatible, ShuffleMode::Uniform] {
            let mut rng = StdRng::seed_from_u64(7);
            let mut items: Vec<u32> = (0..50).collect();
            shuffle(&mut items, mode, &mut rng);
            let mut sorted = items.clone();
            sorted.sort_unstable();
            assert_eq!(sorted, (0..50).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_compatible_shuffle_is_swap_against_full_range() {
        // Replays the same draws the shuffle makes and checks the result.
        let mut items: Vec<u32> = (0..8).collect();
        let mut expected = items.clone();
        let mut draws = StdRng::seed_from_u64(42);
        for i in 0..expected.len() {
            let j = draws.gen_range(0..expected.len());
            expected.swap(i, j);
        }

        shuffle(&mut items, ShuffleMode::Compatible, &mut StdRng::seed_from_u64(42));
        assert_eq!(items, expected);
    }

    #[test]
    fn test_from_config_reads_file_and_literal() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "WEIGHT:2").unwrap();
        writeln!(file, "http://x/a[THOLD]10:20").unwrap();

        let config = GeneratorConfig {
            url: Some("http://x/literal".into()),
            url_file: Some(file.path().to_path_buf()),
            duration_secs: Some(1),
            ..Default::default()
        };
        let source = UrlSource::from_config(&config).unwrap();
        assert_eq!(source.len(), 3);
        assert_eq!(source.targets(), vec!["http://x/a", "http://x/literal"]);
        assert_eq!(source.thresholds().len(), 1);
    }

    #[test]
    fn test_from_config_errors() {
        let config = GeneratorConfig {
            url_file: Some("/nonexistent/urls.txt".into()),
            duration_secs: Some(1),
            ..Default::default()
        };
        assert!(matches!(
            UrlSource::from_config(&config),
            Err(LoadGenError::UrlFile { .. })
        ));

        let file = tempfile::NamedTempFile::new().unwrap();
        let config = GeneratorConfig {
            url_file: Some(file.path().to_path_buf()),
            duration_secs: Some(1),
            ..Default::default()
        };
        assert!(matches!(
            UrlSource::from_config(&config),
            Err(LoadGenError::EmptyUrlList)
        ));
    }
}
