use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CaseStatus {
    Passed,
    Failed,
    Skipped,
}

/// One JUnit-style record per executed (or skipped) case.
#[derive(Serialize, Clone, Debug)]
pub struct CaseResult {
    pub suite: String,
    pub case: String,
    pub duration: Duration,
    pub status: CaseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Accumulated results of one harness run, single writer.
#[derive(Serialize, Clone, Debug)]
pub struct TestReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub results: Vec<CaseResult>,
}

impl Default for TestReport {
    fn default() -> Self {
        Self::new()
    }
}

impl TestReport {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            results: Vec::new(),
        }
    }

    pub fn record(&mut self, result: CaseResult) {
        self.results.push(result);
    }

    pub fn extend(&mut self, results: Vec<CaseResult>) {
        self.results.extend(results);
    }

    pub fn passed(&self) -> usize {
        self.count(CaseStatus::Passed)
    }

    pub fn failed(&self) -> usize {
        self.count(CaseStatus::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(CaseStatus::Skipped)
    }

    fn count(&self, status: CaseStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    /// Serialize as JUnit XML, one `<testsuite>` per suite in first-seen
    /// order.
    pub fn to_junit_xml(&self) -> String {
        let mut suites: Vec<&str> = Vec::new();
        for result in &self.results {
            if !suites.contains(&result.suite.as_str()) {
                suites.push(&result.suite);
            }
        }

        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        xml.push_str(&format!(
            "<testsuites id=\"{}\" tests=\"{}\" failures=\"{}\" skipped=\"{}\">\n",
            self.run_id,
            self.results.len(),
            self.failed(),
            self.skipped()
        ));

        for suite in suites {
            let cases: Vec<&CaseResult> =
                self.results.iter().filter(|r| r.suite == suite).collect();
            let failures = cases
                .iter()
                .filter(|r| r.status == CaseStatus::Failed)
                .count();
            let skipped = cases
                .iter()
                .filter(|r| r.status == CaseStatus::Skipped)
                .count();
            xml.push_str(&format!(
                "  <testsuite name=\"{}\" tests=\"{}\" failures=\"{}\" skipped=\"{}\">\n",
                escape(suite),
                cases.len(),
                failures,
                skipped
            ));
            for case in cases {
                xml.push_str(&format!(
                    "    <testcase name=\"{}\" time=\"{:.3}\"",
                    escape(&case.case),
                    case.duration.as_secs_f64()
                ));
                match case.status {
                    CaseStatus::Passed => xml.push_str("/>\n"),
                    CaseStatus::Failed => {
                        xml.push_str(">\n");
                        xml.push_str(&format!(
                            "      <failure message=\"{}\"/>\n",
                            escape(case.message.as_deref().unwrap_or("failed"))
                        ));
                        xml.push_str("    </testcase>\n");
                    }
                    CaseStatus::Skipped => {
                        xml.push_str(">\n");
                        xml.push_str(&format!(
                            "      <skipped message=\"{}\"/>\n",
                            escape(case.message.as_deref().unwrap_or("skipped"))
                        ));
                        xml.push_str("    </testcase>\n");
                    }
                }
            }
            xml.push_str("  </testsuite>\n");
        }
        xml.push_str("</testsuites>\n");
        xml
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_junit_xml_shape() {
        let mut report = TestReport::new();
        report.record(CaseResult {
            suite: "failover".to_string(),
            case: "mclag".to_string(),
            duration: Duration::from_millis(1500),
            status: CaseStatus::Passed,
            message: None,
        });
        report.record(CaseResult {
            suite: "failover".to_string(),
            case: "spine".to_string(),
            duration: Duration::from_secs(2),
            status: CaseStatus::Failed,
            message: Some("ping <lost>".to_string()),
        });
        report.record(CaseResult {
            suite: "vpc".to_string(),
            case: "isolation".to_string(),
            duration: Duration::ZERO,
            status: CaseStatus::Skipped,
            message: Some("no servers".to_string()),
        });

        let xml = report.to_junit_xml();
        assert!(xml.contains("<testsuite name=\"failover\" tests=\"2\" failures=\"1\" skipped=\"0\">"));
        assert!(xml.contains("<testcase name=\"mclag\" time=\"1.500\"/>"));
        assert!(xml.contains("<failure message=\"ping &lt;lost&gt;\"/>"));
        assert!(xml.contains("<skipped message=\"no servers\"/>"));
        assert_eq!(report.passed(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.skipped(), 1);
    }
}
