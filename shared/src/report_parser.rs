//! Lenient JSON parsing for generative-backend output
//!
//! Model output is not guaranteed to be well-formed JSON. Parsing runs an
//! ordered chain of pure attempts on the fence-stripped text:
//!
//! 1. parse as-is
//! 2. cut to the first balanced object, closing a truncated tail if needed
//! 3. extract the outermost `{ ... }` span
//!
//! Reports that survive none of these are rebuilt from whatever fields can be
//! recovered and flagged with `_fallback: true`.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Characters of raw text kept in a fallback summary
const FALLBACK_SUMMARY_CHARS: usize = 500;

/// Narrative analysis of a query result
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AnalysisReport {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub insights: Vec<String>,
    #[serde(default)]
    pub statistics: Value,
    #[serde(default)]
    pub visualization_suggestions: Vec<Value>,
    #[serde(default)]
    pub markdown: String,
    /// Set when the report was reconstructed from unparseable output
    #[serde(rename = "_fallback", default, skip_serializing_if = "std::ops::Not::not")]
    pub fallback: bool,
}

/// Which step of the repair chain produced a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStrategy {
    Direct,
    BalancedBraces,
    OuterBraces,
    Fallback,
}

/// A report together with the strategy that recovered it
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedReport {
    pub report: AnalysisReport,
    pub strategy: RepairStrategy,
}

/// Remove a surrounding markdown code fence, with or without a language tag
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest.trim_start_matches(|c: char| c.is_ascii_alphabetic()),
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

/// Parse a JSON object out of model output using the repair chain
pub fn parse_json_lenient(raw: &str) -> Option<(Value, RepairStrategy)> {
    let text = strip_code_fences(raw);

    let attempts: [(RepairStrategy, fn(&str) -> Option<Value>); 3] = [
        (RepairStrategy::Direct, parse_direct),
        (RepairStrategy::BalancedBraces, parse_balanced),
        (RepairStrategy::OuterBraces, parse_outer_braces),
    ];

    attempts
        .iter()
        .find_map(|(strategy, attempt)| attempt(text).map(|value| (value, *strategy)))
}

/// Parse a narrative report, falling back to a flagged best-effort report
pub fn parse_report(raw: &str) -> ParsedReport {
    if let Some((value, strategy)) = parse_json_lenient(raw) {
        if let Ok(mut report) = serde_json::from_value::<AnalysisReport>(value) {
            report.fallback = false;
            if report.markdown.is_empty() {
                report.markdown = render_markdown(&report);
            }
            return ParsedReport { report, strategy };
        }
    }

    ParsedReport {
        report: fallback_report(strip_code_fences(raw)),
        strategy: RepairStrategy::Fallback,
    }
}

/// True when output is empty or stops inside an open object, array or string
pub fn looks_truncated(raw: &str) -> bool {
    let text = strip_code_fences(raw);
    if text.is_empty() {
        return true;
    }
    let scan = scan_structure(text);
    scan.in_string || !scan.stack.is_empty()
}

fn parse_direct(text: &str) -> Option<Value> {
    serde_json::from_str::<Value>(text)
        .ok()
        .filter(Value::is_object)
}

fn parse_balanced(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let candidate = &text[start..];
    let scan = scan_structure(candidate);

    if let Some(end) = scan.first_complete {
        return parse_direct(&candidate[..=end]);
    }

    // Truncated: cut after the last closed container and close the rest.
    let (cut, open) = scan.last_close?;
    let mut repaired = candidate[..=cut].to_string();
    for opener in open.iter().rev() {
        repaired.push(if *opener == '{' { '}' } else { ']' });
    }
    parse_direct(&repaired)
}

fn parse_outer_braces(text: &str) -> Option<Value> {
    static OUTER: OnceLock<Regex> = OnceLock::new();
    let outer = OUTER.get_or_init(|| Regex::new(r"(?s)\{.*\}").expect("outer brace pattern is valid"));
    outer.find(text).and_then(|m| parse_direct(m.as_str()))
}

struct StructureScan {
    /// Index of the brace closing the first top-level object
    first_complete: Option<usize>,
    /// Index of the last closing bracket and the containers still open after it
    last_close: Option<(usize, Vec<char>)>,
    stack: Vec<char>,
    in_string: bool,
}

fn scan_structure(text: &str) -> StructureScan {
    let mut scan = StructureScan {
        first_complete: None,
        last_close: None,
        stack: Vec::new(),
        in_string: false,
    };
    let mut escaped = false;

    for (index, ch) in text.char_indices() {
        if scan.in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => scan.in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => scan.in_string = true,
            '{' | '[' => scan.stack.push(ch),
            '}' | ']' => {
                scan.stack.pop();
                if scan.stack.is_empty() {
                    if scan.first_complete.is_none() && ch == '}' {
                        scan.first_complete = Some(index);
                    }
                } else {
                    scan.last_close = Some((index, scan.stack.clone()));
                }
            }
            _ => {}
        }
    }

    scan
}

fn fallback_report(text: &str) -> AnalysisReport {
    static SUMMARY: OnceLock<Regex> = OnceLock::new();
    static INSIGHTS: OnceLock<Regex> = OnceLock::new();
    static QUOTED: OnceLock<Regex> = OnceLock::new();

    let summary_field = SUMMARY.get_or_init(|| {
        Regex::new(r#""summary"\s*:\s*"((?:[^"\\]|\\.)*)"#).expect("summary pattern is valid")
    });
    let insights_field = INSIGHTS
        .get_or_init(|| Regex::new(r#"(?s)"insights"\s*:\s*\[(.*?)(\]|$)"#).expect("insights pattern is valid"));
    let quoted = QUOTED.get_or_init(|| Regex::new(r#""((?:[^"\\]|\\.)*)""#).expect("quoted pattern is valid"));

    let summary = summary_field
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| unescape(m.as_str()))
        .unwrap_or_else(|| text.chars().take(FALLBACK_SUMMARY_CHARS).collect::<String>().trim().to_string());

    let insights = insights_field
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| {
            quoted
                .captures_iter(m.as_str())
                .filter_map(|c| c.get(1).map(|s| unescape(s.as_str())))
                .collect()
        })
        .unwrap_or_default();

    let mut report = AnalysisReport {
        summary,
        insights,
        fallback: true,
        ..AnalysisReport::default()
    };
    report.markdown = render_markdown(&report);
    report
}

fn unescape(fragment: &str) -> String {
    serde_json::from_str::<String>(&format!("\"{}\"", fragment)).unwrap_or_else(|_| fragment.to_string())
}

fn render_markdown(report: &AnalysisReport) -> String {
    let mut markdown = format!("## Summary\n\n{}\n", report.summary);
    if !report.insights.is_empty() {
        markdown.push_str("\n## Insights\n\n");
        for insight in &report.insights {
            markdown.push_str("- ");
            markdown.push_str(insight);
            markdown.push('\n');
        }
    }
    markdown
}
