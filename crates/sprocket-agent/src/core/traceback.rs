use std::collections::HashMap;
use std::path::Path;

use sprocket_proto::{CachedLine, TracebackFrame, TracebackPayload};

const MAX_FRAMES: usize = 64;

/// Resolves a captured backtrace into portable frame records plus a line
/// cache of the source text they reference. Consumers render traces
/// without the container's source tree, so the text travels with the
/// frames; files that are not present on disk are simply absent from the
/// cache.
pub fn extract_traceback(
    backtrace: &backtrace::Backtrace,
) -> (TracebackPayload, Vec<CachedLine>) {
    let mut frames = Vec::new();
    let mut cache = Vec::new();
    let mut sources: HashMap<String, Option<Vec<String>>> = HashMap::new();

    for frame in backtrace.frames() {
        for symbol in frame.symbols() {
            let (Some(file), Some(lineno)) =
                (symbol.filename(), symbol.lineno())
            else {
                continue;
            };
            let file = file.display().to_string();
            let function = symbol
                .name()
                .map(|name| name.to_string())
                .unwrap_or_else(|| "<unknown>".to_string());

            if let Some(line) = lookup_line(&mut sources, &file, lineno) {
                cache.push(CachedLine { file: file.clone(), lineno, line });
            }
            frames.push(TracebackFrame {
                file,
                lineno,
                function,
                locals_summary: None,
            });
            if frames.len() >= MAX_FRAMES {
                return (TracebackPayload { frames }, cache);
            }
        }
    }

    (TracebackPayload { frames }, cache)
}

/// Plain-text rendition of a traceback, newest frame last, terminated by
/// the exception repr.
pub fn format_traceback(payload: &TracebackPayload, repr: &str) -> String {
    let mut out = String::from("Traceback (most recent call last):\n");
    for frame in payload.frames.iter().rev() {
        out.push_str(&format!(
            "  File \"{}\", line {}, in {}\n",
            frame.file, frame.lineno, frame.function
        ));
    }
    out.push_str(repr);
    out.push('\n');
    out
}

fn lookup_line(
    sources: &mut HashMap<String, Option<Vec<String>>>,
    file: &str,
    lineno: u32,
) -> Option<String> {
    let lines = sources.entry(file.to_string()).or_insert_with(|| {
        if !Path::new(file).is_file() {
            return None;
        }
        std::fs::read_to_string(file)
            .ok()
            .map(|text| text.lines().map(str::to_string).collect())
    });
    let lines = lines.as_ref()?;
    lines.get(lineno.saturating_sub(1) as usize).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_frames_for_a_local_call() {
        let backtrace = backtrace::Backtrace::new();
        let (payload, _cache) = extract_traceback(&backtrace);
        assert!(!payload.frames.is_empty());
        assert!(payload.frames.len() <= MAX_FRAMES);
        assert!(payload.frames.iter().all(|frame| frame.lineno > 0));
    }

    #[test]
    fn line_cache_entries_match_local_sources() {
        let backtrace = backtrace::Backtrace::new();
        let (_payload, cache) = extract_traceback(&backtrace);
        for entry in &cache {
            assert!(!entry.file.is_empty());
            assert!(entry.lineno > 0);
        }
    }

    #[test]
    fn formatted_trace_ends_with_repr() {
        let payload = TracebackPayload {
            frames: vec![TracebackFrame {
                file: "src/job.rs".to_string(),
                lineno: 7,
                function: "run".to_string(),
                locals_summary: None,
            }],
        };
        let text = format_traceback(&payload, "ValueError(\"nope\")");
        assert!(text.starts_with("Traceback"));
        assert!(text.contains("src/job.rs"));
        assert!(text.ends_with("ValueError(\"nope\")\n"));
    }
}
