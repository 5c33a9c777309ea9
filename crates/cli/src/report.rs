use anyhow::Context;
use labwired_utest_config::PlatformConfig;
use labwired_utest_core::runner::{CaseReport, CaseStatus, RunSummary};
use labwired_utest_core::OutputStats;
use serde::Serialize;
use std::fmt::Write as _;
use std::path::Path;

#[derive(Debug, Serialize)]
pub struct RunResult<'a> {
    pub status: &'static str,
    pub tests: usize,
    pub passed: usize,
    pub failed: usize,
    pub checks: u32,
    pub elapsed_ms: u64,
    pub output: OutputStats,
    pub output_sha256: String,
    pub config: &'a PlatformConfig,
    pub cases: &'a [CaseReport],
}

impl<'a> RunResult<'a> {
    pub fn new(
        summary: &'a RunSummary,
        config: &'a PlatformConfig,
        output: OutputStats,
        output_sha256: String,
    ) -> Self {
        Self {
            status: if summary.is_success() { "pass" } else { "fail" },
            tests: summary.cases.len(),
            passed: summary.passed,
            failed: summary.failed,
            checks: summary.checks,
            elapsed_ms: summary.elapsed_ms,
            output,
            output_sha256,
            config,
            cases: &summary.cases,
        }
    }
}

/// Write `result.json` and `junit.xml` into `dir`, creating it if needed.
pub fn write_artifacts(dir: &Path, result: &RunResult<'_>) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory {:?}", dir))?;

    let json = serde_json::to_string_pretty(result)?;
    let result_path = dir.join("result.json");
    std::fs::write(&result_path, json)
        .with_context(|| format!("Failed to write {:?}", result_path))?;

    let junit_path = dir.join("junit.xml");
    std::fs::write(&junit_path, junit_xml(result))
        .with_context(|| format!("Failed to write {:?}", junit_path))?;

    tracing::info!("Wrote run artifacts to {:?}", dir);
    Ok(())
}

pub fn junit_xml(result: &RunResult<'_>) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    let _ = writeln!(
        xml,
        "<testsuite name=\"labwired-utest\" tests=\"{}\" failures=\"{}\" time=\"{}\">",
        result.tests,
        result.failed,
        seconds(result.elapsed_ms)
    );
    for case in result.cases {
        let _ = write!(
            xml,
            "  <testcase classname=\"{}\" name=\"{}\" time=\"{}\"",
            escape(&case.group),
            escape(&case.name),
            seconds(case.elapsed_ms)
        );
        match (case.status, &case.failure) {
            (CaseStatus::Failed, Some(message)) => {
                let _ = writeln!(xml, ">");
                let _ = writeln!(xml, "    <failure message=\"{}\"/>", escape(message));
                let _ = writeln!(xml, "  </testcase>");
            }
            _ => {
                let _ = writeln!(xml, "/>");
            }
        }
    }
    xml.push_str("</testsuite>\n");
    xml
}

fn seconds(ms: u64) -> String {
    format!("{}.{:03}", ms / 1000, ms % 1000)
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}
