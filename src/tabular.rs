use anyhow::{Context, Result};
use serde::Deserialize;

use crate::types::{EvalItem, EvalOutcome};

#[derive(Debug, Deserialize)]
struct RawRow {
    #[serde(default)]
    id: Option<String>,
    #[serde(alias = "title")]
    text: String,
    #[serde(default)]
    ground_truth: Option<String>,
}

/// Parse an uploaded delimited file into evaluation items. Requires a
/// `text` (or `title`) column; `id` and `ground_truth` are optional,
/// with blank ground-truth cells treated as absent.
pub fn parse_items(bytes: &[u8]) -> Result<Vec<EvalItem>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let mut items = Vec::new();
    for (idx, row) in reader.deserialize::<RawRow>().enumerate() {
        let row = row.with_context(|| format!("row {}", idx + 1))?;
        items.push(EvalItem {
            id: row.id.filter(|id| !id.is_empty()),
            text: row.text,
            ground_truth: row.ground_truth.filter(|gt| !gt.is_empty()),
        });
    }

    Ok(items)
}

/// Render evaluation outcomes as the result CSV returned to operators.
pub fn render_outcomes(outcomes: &[EvalOutcome]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record([
        "id",
        "text",
        "prediction",
        "confidence",
        "ground_truth",
        "is_correct",
        "latency_ms",
    ])?;

    for outcome in outcomes {
        writer.write_record([
            outcome.id.as_str(),
            outcome.text.as_str(),
            outcome.label.as_str(),
            &format!("{:.4}", outcome.confidence),
            outcome.ground_truth.as_deref().unwrap_or(""),
            &outcome
                .is_correct
                .map(|c| c.to_string())
                .unwrap_or_default(),
            &format!("{:.2}", outcome.latency_ms),
        ])?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("csv flush error: {e}"))?;
    Ok(String::from_utf8(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_rows() {
        let csv = b"id,text,ground_truth\n1,Apple releases iPhone,TECHNOLOGY\n2,Stocks slide,BUSINESS\n";
        let items = parse_items(csv).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id.as_deref(), Some("1"));
        assert_eq!(items[0].text, "Apple releases iPhone");
        assert_eq!(items[0].ground_truth.as_deref(), Some("TECHNOLOGY"));
    }

    #[test]
    fn accepts_title_header_and_blank_cells() {
        let csv = b"title,ground_truth\nCOVID cases surge,\nNew chip ships,HEALTH\n";
        let items = parse_items(csv).unwrap();
        assert_eq!(items[0].text, "COVID cases surge");
        assert!(items[0].id.is_none());
        assert!(items[0].ground_truth.is_none());
        assert_eq!(items[1].ground_truth.as_deref(), Some("HEALTH"));
    }

    #[test]
    fn missing_text_column_is_an_error() {
        let csv = b"headline,ground_truth\nsomething,TECH\n";
        assert!(parse_items(csv).is_err());
    }

    #[test]
    fn renders_header_and_rows() {
        let outcomes = vec![EvalOutcome {
            id: "1".to_string(),
            text: "Apple releases iPhone".to_string(),
            label: "TECHNOLOGY".to_string(),
            confidence: 0.9312,
            ground_truth: Some("TECHNOLOGY".to_string()),
            is_correct: Some(true),
            latency_ms: 12.345,
        }];

        let rendered = render_outcomes(&outcomes).unwrap();
        let mut lines = rendered.lines();
        assert_eq!(
            lines.next().unwrap(),
            "id,text,prediction,confidence,ground_truth,is_correct,latency_ms"
        );
        assert_eq!(
            lines.next().unwrap(),
            "1,Apple releases iPhone,TECHNOLOGY,0.9312,TECHNOLOGY,true,12.35"
        );
    }
}
