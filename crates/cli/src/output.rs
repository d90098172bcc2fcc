use ferrous_upstream_domain::DomainError;
use hickory_proto::op::Message;
use serde::Serialize;
use std::fmt::Write;
use std::time::Duration;

/// Outcome of one query, as printed by the CLI.
#[derive(Debug, Serialize)]
pub struct QueryReport {
    pub id: u16,
    pub question: String,
    pub latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub answers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryReport {
    pub fn new(query: &Message, result: Result<Message, DomainError>, elapsed: Duration) -> Self {
        let question = query
            .queries()
            .first()
            .map(|q| format!("{} {}", q.name(), q.query_type()))
            .unwrap_or_default();
        let latency_ms = elapsed.as_secs_f64() * 1000.0;

        match result {
            Ok(response) => Self {
                id: response.id(),
                question,
                latency_ms,
                truncated: Some(response.truncated()),
                answers: response.answers().iter().map(|r| r.to_string()).collect(),
                error: None,
            },
            Err(e) => Self {
                id: query.id(),
                question,
                latency_ms,
                truncated: None,
                answers: Vec::new(),
                error: Some(e.to_string()),
            },
        }
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        if let Some(error) = &self.error {
            let _ = writeln!(
                out,
                ";; id {} {} error after {:.2} ms: {}",
                self.id, self.question, self.latency_ms, error
            );
            return out;
        }
        let _ = writeln!(
            out,
            ";; id {} {} answers={} truncated={} ({:.2} ms)",
            self.id,
            self.question,
            self.answers.len(),
            self.truncated.unwrap_or(false),
            self.latency_ms
        );
        for answer in &self.answers {
            let _ = writeln!(out, "{}", answer);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrous_upstream_infrastructure::dns::codec::build_query;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{RData, Record, RecordType};
    use std::net::Ipv4Addr;

    #[test]
    fn test_report_for_answered_query() {
        let query = build_query("example.com", RecordType::A).unwrap();
        let mut response = query.clone();
        let name = query.queries()[0].name().clone();
        response.add_answer(Record::from_rdata(name, 60, RData::A(A(Ipv4Addr::new(93, 184, 216, 34)))));

        let report = QueryReport::new(&query, Ok(response), Duration::from_millis(12));

        assert_eq!(report.id, query.id());
        assert_eq!(report.truncated, Some(false));
        assert_eq!(report.answers.len(), 1);
        assert!(report.answers[0].contains("93.184.216.34"));
        let text = report.render_text();
        assert!(text.contains("answers=1 truncated=false"));
        assert!(text.contains("93.184.216.34"));

        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("error").is_none());
        assert_eq!(json["answers"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_report_for_failed_query() {
        let query = build_query("example.com", RecordType::AAAA).unwrap();
        let err = DomainError::TransportTimeout {
            server: "127.0.0.1:53".into(),
        };

        let report = QueryReport::new(&query, Err(err), Duration::from_secs(5));

        assert_eq!(report.id, query.id());
        assert!(report.render_text().contains("error after 5000.00 ms: Transport timeout"));
        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("answers").is_none());
        assert!(json["error"].as_str().unwrap().contains("127.0.0.1:53"));
    }
}
