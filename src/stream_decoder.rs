use serde::Deserialize;
use serde_json::{Map, Value};

/// One decoded item from the event stream: forwarded output text, or the
/// final structured result.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Text(String),
    Outputs(Map<String, Value>),
}

#[derive(Debug, Deserialize)]
struct EventRecord {
    value: EventValue,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum EventValue {
    Generation {
        state: String,
        #[serde(default)]
        label: Option<String>,
    },
    Chunk {
        #[serde(default)]
        value: Option<String>,
    },
    Outputs {
        values: OutputValues,
    },
}

#[derive(Debug, Deserialize)]
struct OutputValues {
    output: Map<String, Value>,
}

/// Incremental decoder for the newline-delimited event records the
/// streaming endpoint emits.
///
/// Each complete line is one JSON record wrapped as `{"value": {...}}`.
/// `generation` records labelled `output` open and close the final-output
/// window; `chunk` text inside that window is forwarded; an `outputs`
/// record carries the full structured result. Lines split across chunk
/// boundaries are buffered until their newline arrives. The decoder owns
/// no IO: callers drive it from a byte stream and drop it on any exit
/// path, which releases the underlying connection.
#[derive(Default)]
pub struct EventStreamDecoder {
    buffer: String,
    in_final_output: bool,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of bytes, returning the items completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamItem> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut items = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            self.decode_line(line.trim_end(), &mut items);
        }
        items
    }

    /// Flush at end-of-stream: a final record without a trailing newline is
    /// still decoded.
    pub fn finish(&mut self) -> Vec<StreamItem> {
        let line = std::mem::take(&mut self.buffer);
        let mut items = Vec::new();
        self.decode_line(line.trim_end(), &mut items);
        items
    }

    fn decode_line(&mut self, line: &str, items: &mut Vec<StreamItem>) {
        if line.is_empty() {
            return;
        }

        let record = match serde_json::from_str::<EventRecord>(line) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Skipping undecodable stream line: {}", e);
                return;
            }
        };

        match record.value {
            EventValue::Generation { state, label } => {
                if label.as_deref() == Some("output") {
                    self.in_final_output = state == "start";
                }
            }
            EventValue::Chunk { value } => {
                if self.in_final_output {
                    items.push(StreamItem::Text(value.unwrap_or_default()));
                }
            }
            EventValue::Outputs { values } => {
                items.push(StreamItem::Outputs(values.output));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn generation(state: &str, label: &str) -> String {
        json!({"value": {"type": "generation", "state": state, "label": label}}).to_string()
    }

    fn chunk(text: &str) -> String {
        json!({"value": {"type": "chunk", "value": text}}).to_string()
    }

    #[test]
    fn only_final_output_chunks_pass_through() {
        let mut decoder = EventStreamDecoder::new();
        let stream = format!(
            "{}\n{}\n{}\n{}\n{}\n{}\n",
            generation("start", "reasoning"),
            chunk("hidden"),
            generation("start", "output"),
            chunk("visible"),
            generation("end", "output"),
            chunk("also hidden"),
        );

        let items = decoder.feed(stream.as_bytes());
        assert_eq!(items, vec![StreamItem::Text("visible".to_string())]);
    }

    #[test]
    fn buffers_lines_split_across_chunks() {
        let mut decoder = EventStreamDecoder::new();
        let line = format!("{}\n{}\n", generation("start", "output"), chunk("split"));
        let (first, second) = line.split_at(line.len() / 2);

        let mut items = decoder.feed(first.as_bytes());
        items.extend(decoder.feed(second.as_bytes()));
        assert_eq!(items, vec![StreamItem::Text("split".to_string())]);
    }

    #[test]
    fn outputs_record_carries_structured_result() {
        let mut decoder = EventStreamDecoder::new();
        let line = json!({
            "value": {
                "type": "outputs",
                "values": {"output": {"roast": "spicy", "mbti": "ENTP"}}
            }
        })
        .to_string();

        let items = decoder.feed(format!("{}\n", line).as_bytes());
        match &items[0] {
            StreamItem::Outputs(output) => {
                assert_eq!(output.get("roast").and_then(Value::as_str), Some("spicy"));
                assert_eq!(output.get("mbti").and_then(Value::as_str), Some("ENTP"));
            }
            other => panic!("expected outputs, got {:?}", other),
        }
    }

    #[test]
    fn finish_flushes_an_unterminated_final_line() {
        let mut decoder = EventStreamDecoder::new();
        decoder.feed(format!("{}\n", generation("start", "output")).as_bytes());
        let items = decoder.feed(chunk("tail").as_bytes());
        assert!(items.is_empty());

        let items = decoder.finish();
        assert_eq!(items, vec![StreamItem::Text("tail".to_string())]);
    }

    #[test]
    fn undecodable_lines_are_skipped() {
        let mut decoder = EventStreamDecoder::new();
        let stream = format!(
            "not json\n{}\n{}\n",
            generation("start", "output"),
            chunk("after garbage"),
        );

        let items = decoder.feed(stream.as_bytes());
        assert_eq!(items, vec![StreamItem::Text("after garbage".to_string())]);
    }
}
