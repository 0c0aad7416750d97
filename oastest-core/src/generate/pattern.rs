//! Synthesis of strings matching a regex pattern.
//!
//! The pattern is parsed into a `regex-syntax` HIR and walked with random
//! choices at every class, repetition, and alternation. Anchors and other
//! look-around assertions contribute nothing to the output.

use rand::Rng;
use regex_syntax::hir::{Class, Hir, HirKind};
use regex_syntax::ParserBuilder;

use crate::error::{Error, Result};

/// Cap for unbounded repetitions such as `\d{6,}` or `a*`.
const OPEN_REPEAT_EXTRA: u32 = 6;

/// Produces a string matching `pattern`.
pub fn generate_matching(pattern: &str) -> Result<String> {
    let hir = ParserBuilder::new()
        .build()
        .parse(pattern)
        .map_err(|error| Error::invalid_spec(format!("pattern must be a valid regex: {error}")))?;
    let mut out = String::new();
    walk(&hir, &mut out, &mut rand::thread_rng());
    Ok(out)
}

fn walk<R: Rng>(hir: &Hir, out: &mut String, rng: &mut R) {
    match hir.kind() {
        HirKind::Empty | HirKind::Look(_) => {}
        HirKind::Literal(literal) => {
            out.push_str(&String::from_utf8_lossy(&literal.0));
        }
        HirKind::Class(Class::Unicode(class)) => {
            let ranges = class.ranges();
            if ranges.is_empty() {
                return;
            }
            let range = &ranges[rng.gen_range(0..ranges.len())];
            let (start, end) = (range.start() as u32, range.end() as u32);
            for _ in 0..8 {
                if let Some(ch) = char::from_u32(rng.gen_range(start..=end)) {
                    out.push(ch);
                    return;
                }
            }
            out.push(range.start());
        }
        HirKind::Class(Class::Bytes(class)) => {
            let ranges = class.ranges();
            if ranges.is_empty() {
                return;
            }
            let range = &ranges[rng.gen_range(0..ranges.len())];
            let byte = rng.gen_range(range.start()..=range.end());
            out.push(byte as char);
        }
        HirKind::Repetition(repetition) => {
            let min = repetition.min;
            let max = repetition
                .max
                .unwrap_or_else(|| min.saturating_add(OPEN_REPEAT_EXTRA));
            let max = max.max(min);
            let count = rng.gen_range(min..=max);
            for _ in 0..count {
                walk(&repetition.sub, out, rng);
            }
        }
        HirKind::Capture(capture) => walk(&capture.sub, out, rng),
        HirKind::Concat(parts) => {
            for part in parts {
                walk(part, out, rng);
            }
        }
        HirKind::Alternation(parts) => {
            if parts.is_empty() {
                return;
            }
            let pick = rng.gen_range(0..parts.len());
            walk(&parts[pick], out, rng);
        }
    }
}
