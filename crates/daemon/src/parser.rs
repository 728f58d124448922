use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::time::Duration;

/// One recognized line of ab-av1 output. Unrecognized lines produce no
/// event; the runner still keeps them in its rolling tail for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolEvent {
    /// Finished quality sample from a crf-search run.
    SampleResult {
        sample: u32,
        crf: f64,
        score: f64,
        predicted_filesize: u64,
        percent: f64,
    },
    /// Intermediate crf-search progress.
    SearchProgress { crf: f64, score: f64, percent: f64 },
    /// Encode progress with throughput and time remaining.
    EncodeProgress { percent: f64, fps: f64, eta: Duration },
    Warning { reason: String },
    /// Terminal success line of a search, naming the winning CRF.
    Success { crf: f64 },
}

struct Pattern {
    regex: Regex,
    build: fn(&Captures) -> Option<ToolEvent>,
}

static PATTERNS: Lazy<Vec<Pattern>> = Lazy::new(|| {
    vec![
        Pattern {
            regex: Regex::new(
                r"^sample (?P<sample>\d+): crf (?P<crf>\d+(?:\.\d+)?), VMAF (?P<score>\d+(?:\.\d+)?), predicted full encode size (?P<size>\d+(?:\.\d+)?(?:\s*[KMGT]i?B|\s*B)?), (?P<percent>\d+(?:\.\d+)?)%$",
            )
            .expect("sample-result pattern"),
            build: |caps| {
                Some(ToolEvent::SampleResult {
                    sample: parse_u32(caps.name("sample")?.as_str())?,
                    crf: parse_f64(caps.name("crf")?.as_str())?,
                    score: parse_f64(caps.name("score")?.as_str())?,
                    predicted_filesize: parse_byte_size(caps.name("size")?.as_str())?,
                    percent: parse_f64(caps.name("percent")?.as_str())?,
                })
            },
        },
        Pattern {
            regex: Regex::new(
                r"^crf (?P<crf>\d+(?:\.\d+)?) VMAF (?P<score>\d+(?:\.\d+)?), progress (?P<percent>\d+(?:\.\d+)?)%$",
            )
            .expect("search-progress pattern"),
            build: |caps| {
                Some(ToolEvent::SearchProgress {
                    crf: parse_f64(caps.name("crf")?.as_str())?,
                    score: parse_f64(caps.name("score")?.as_str())?,
                    percent: parse_f64(caps.name("percent")?.as_str())?,
                })
            },
        },
        Pattern {
            regex: Regex::new(
                r"^encoded (?P<percent>\d+(?:\.\d+)?)%, (?P<fps>\d+(?:\.\d+)?) fps, eta (?P<eta>\S+)$",
            )
            .expect("encode-progress pattern"),
            build: |caps| {
                Some(ToolEvent::EncodeProgress {
                    percent: parse_f64(caps.name("percent")?.as_str())?,
                    fps: parse_f64(caps.name("fps")?.as_str())?,
                    eta: parse_eta(caps.name("eta")?.as_str())?,
                })
            },
        },
        Pattern {
            regex: Regex::new(r"^[Ww]arning:?\s+(?P<reason>.+)$").expect("warning pattern"),
            build: |caps| {
                Some(ToolEvent::Warning {
                    reason: caps.name("reason")?.as_str().to_string(),
                })
            },
        },
        Pattern {
            regex: Regex::new(r"^crf (?P<crf>\d+(?:\.\d+)?) successful$").expect("success pattern"),
            build: |caps| {
                Some(ToolEvent::Success {
                    crf: parse_f64(caps.name("crf")?.as_str())?,
                })
            },
        },
    ]
});

/// Parse one trimmed output line. First matching pattern wins; lines that
/// match nothing are dropped.
pub fn parse_line(line: &str) -> Option<ToolEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    for pattern in PATTERNS.iter() {
        if let Some(caps) = pattern.regex.captures(line) {
            if let Some(event) = (pattern.build)(&caps) {
                return Some(event);
            }
        }
    }
    None
}

fn parse_u32(s: &str) -> Option<u32> {
    s.parse().ok()
}

fn parse_f64(s: &str) -> Option<f64> {
    s.parse().ok()
}

/// Byte sizes arrive either as a plain count or with a unit suffix
/// ("123456", "1.2 GB", "800 MiB"). Decimal units are 1000-based, binary
/// units 1024-based.
pub fn parse_byte_size(s: &str) -> Option<u64> {
    static SIZE_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^(?P<value>\d+(?:\.\d+)?)\s*(?P<unit>[KMGT]i?B|B)?$").expect("size pattern")
    });

    let caps = SIZE_RE.captures(s.trim())?;
    let value: f64 = caps.name("value")?.as_str().parse().ok()?;
    let multiplier: f64 = match caps.name("unit").map(|m| m.as_str()) {
        None | Some("B") => 1.0,
        Some("KB") => 1e3,
        Some("MB") => 1e6,
        Some("GB") => 1e9,
        Some("TB") => 1e12,
        Some("KiB") => 1024.0,
        Some("MiB") => 1024.0 * 1024.0,
        Some("GiB") => 1024.0 * 1024.0 * 1024.0,
        Some("TiB") => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        Some(_) => return None,
    };

    if value < 0.0 {
        return None;
    }
    Some((value * multiplier).round() as u64)
}

/// ETAs arrive either as "1h2m3s"-style component strings or as a plain
/// float second count.
pub fn parse_eta(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<f64>() {
        if secs < 0.0 {
            return None;
        }
        return Some(Duration::from_secs_f64(secs));
    }

    static ETA_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(
            r"^(?:(?P<days>\d+)d)?(?:(?P<hours>\d+)h)?(?:(?P<minutes>\d+)m)?(?:(?P<seconds>\d+(?:\.\d+)?)s)?$",
        )
        .expect("eta pattern")
    });

    let caps = ETA_RE.captures(s)?;
    let days: u64 = caps.name("days").map_or(Ok(0), |m| m.as_str().parse()).ok()?;
    let hours: u64 = caps
        .name("hours")
        .map_or(Ok(0), |m| m.as_str().parse())
        .ok()?;
    let minutes: u64 = caps
        .name("minutes")
        .map_or(Ok(0), |m| m.as_str().parse())
        .ok()?;
    let seconds: f64 = caps
        .name("seconds")
        .map_or(Ok(0.0), |m| m.as_str().parse())
        .ok()?;

    // A fully-empty match means the input was not a duration at all.
    if caps.name("days").is_none()
        && caps.name("hours").is_none()
        && caps.name("minutes").is_none()
        && caps.name("seconds").is_none()
    {
        return None;
    }

    let total = (days * 86_400 + hours * 3_600 + minutes * 60) as f64 + seconds;
    Some(Duration::from_secs_f64(total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_result_line() {
        let event = parse_line("sample 3: crf 28, VMAF 95.32, predicted full encode size 1.2 GB, 42%")
            .expect("should parse");
        assert_eq!(
            event,
            ToolEvent::SampleResult {
                sample: 3,
                crf: 28.0,
                score: 95.32,
                predicted_filesize: 1_200_000_000,
                percent: 42.0,
            }
        );
    }

    #[test]
    fn test_search_progress_line() {
        let event = parse_line("crf 24.5 VMAF 96.1, progress 80%").expect("should parse");
        assert_eq!(
            event,
            ToolEvent::SearchProgress {
                crf: 24.5,
                score: 96.1,
                percent: 80.0,
            }
        );
    }

    #[test]
    fn test_encode_progress_line_with_component_eta() {
        let event = parse_line("encoded 12.5%, 31.2 fps, eta 1h2m3s").expect("should parse");
        assert_eq!(
            event,
            ToolEvent::EncodeProgress {
                percent: 12.5,
                fps: 31.2,
                eta: Duration::from_secs(3723),
            }
        );
    }

    #[test]
    fn test_encode_progress_line_with_float_eta() {
        let event = parse_line("encoded 99%, 120 fps, eta 45.5").expect("should parse");
        assert_eq!(
            event,
            ToolEvent::EncodeProgress {
                percent: 99.0,
                fps: 120.0,
                eta: Duration::from_secs_f64(45.5),
            }
        );
    }

    #[test]
    fn test_warning_line() {
        let event = parse_line("Warning: fallback to libvmaf model").expect("should parse");
        assert_eq!(
            event,
            ToolEvent::Warning {
                reason: "fallback to libvmaf model".to_string(),
            }
        );
    }

    #[test]
    fn test_success_line() {
        let event = parse_line("crf 28 successful").expect("should parse");
        assert_eq!(event, ToolEvent::Success { crf: 28.0 });
    }

    #[test]
    fn test_unmatched_lines_are_dropped() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("   "), None);
        assert_eq!(parse_line("Svt[info]: SVT [version]: 2.1.0"), None);
        assert_eq!(parse_line("encoding started"), None);
    }

    #[test]
    fn test_byte_size_units() {
        assert_eq!(parse_byte_size("123456"), Some(123_456));
        assert_eq!(parse_byte_size("800 MB"), Some(800_000_000));
        assert_eq!(parse_byte_size("1.5 GiB"), Some(1_610_612_736));
        assert_eq!(parse_byte_size("2TB"), Some(2_000_000_000_000));
        assert_eq!(parse_byte_size("12 XB"), None);
        assert_eq!(parse_byte_size("garbage"), None);
    }

    #[test]
    fn test_eta_forms() {
        assert_eq!(parse_eta("90"), Some(Duration::from_secs(90)));
        assert_eq!(parse_eta("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_eta("1d2h"), Some(Duration::from_secs(93_600)));
        assert_eq!(parse_eta("15s"), Some(Duration::from_secs(15)));
        assert_eq!(parse_eta("soon"), None);
        assert_eq!(parse_eta(""), None);
    }
}
