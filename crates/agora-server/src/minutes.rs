//! CSV minutes export, served back to clients via the `/minutes` static route.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use uuid::Uuid;

use agora_engine::services::MinutesExporter;
use agora_types::models::StoredMessage;

pub struct CsvMinutesExporter {
    dir: PathBuf,
}

impl CsvMinutesExporter {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn render_csv(messages: &[StoredMessage], topic: &str, participants: &[String]) -> String {
    let mut out = String::new();
    out.push_str(&format!("topic,{}\n", csv_field(topic)));
    out.push_str(&format!("participants,{}\n", csv_field(&participants.join(", "))));
    out.push('\n');
    out.push_str("timestamp,username,stance,content,agree,partial,disagree\n");
    for m in messages {
        let counts = m.reactions.counts();
        out.push_str(&format!(
            "{},{},{},{},{},{},{}\n",
            m.created_at.to_rfc3339(),
            csv_field(&m.username),
            csv_field(&m.stance),
            csv_field(&m.content),
            counts.agree,
            counts.partial,
            counts.disagree,
        ));
    }
    out
}

#[async_trait]
impl MinutesExporter for CsvMinutesExporter {
    async fn render_minutes(
        &self,
        messages: &[StoredMessage],
        topic: &str,
        participants: &[String],
    ) -> Result<String> {
        let filename = format!("minutes_{}.csv", Uuid::new_v4().simple());
        let path = self.dir.join(&filename);
        let body = render_csv(messages, topic, participants);

        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("failed to write minutes file {}", path.display()))?;

        Ok(format!("/minutes/{}", filename))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_with_commas_and_quotes_are_escaped() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn render_includes_header_and_rows() {
        let mut msg = StoredMessage::new("r1", "A", "first, point", "opinion");
        msg.reactions.toggle("B", agora_types::models::ReactionKind::Agree);

        let csv = render_csv(&[msg], "budget", &["A".into(), "B".into()]);
        assert!(csv.starts_with("topic,budget\n"));
        assert!(csv.contains("participants,\"A, B\"\n"));
        assert!(csv.contains(",A,opinion,\"first, point\",1,0,0\n"));
    }

    #[tokio::test]
    async fn exporter_writes_file_and_returns_relative_url() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = CsvMinutesExporter::new(dir.path().to_path_buf());

        let url = exporter
            .render_minutes(&[StoredMessage::new("r1", "A", "x", "opinion")], "t", &["A".into()])
            .await
            .unwrap();

        assert!(url.starts_with("/minutes/minutes_"));
        let filename = url.strip_prefix("/minutes/").unwrap();
        let written = std::fs::read_to_string(dir.path().join(filename)).unwrap();
        assert!(written.contains("timestamp,username,stance,content"));
    }
}
