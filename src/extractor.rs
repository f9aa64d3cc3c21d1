//! Defensive decoding of structured records from free-form model output.
//!
//! Models wrap JSON in code fences, surround it with prose, and pick
//! different top-level shapes from one call to the next. [`extract_with`]
//! tolerates all of that and never fails: the worst case is an empty
//! [`Extraction`] tagged [`ResponseShape::Unparsable`] or
//! [`ResponseShape::Unrecognized`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One decoded JSON object.
pub type Record = Map<String, Value>;

/// Which top-level layout the decoded value had.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseShape {
    /// `[ {record}, ... ]`
    RecordList,
    /// `[ { "results": [ {record}, ... ] } ]`
    NestedResults,
    /// `{ "results": [ {record}, ... ] }`
    ResultsObject,
    /// Valid JSON, but none of the layouts above.
    Unrecognized,
    /// No JSON value could be decoded at all.
    Unparsable,
}

/// Result of running the extractor over one response.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub shape: ResponseShape,
    pub records: Vec<Record>,
}

impl Extraction {
    fn new(shape: ResponseShape, records: Vec<Record>) -> Self {
        Self { shape, records }
    }

    /// The response decoded into one of the known layouts, possibly empty.
    pub fn is_recognized(&self) -> bool {
        matches!(
            self.shape,
            ResponseShape::RecordList | ResponseShape::NestedResults | ResponseShape::ResultsObject
        )
    }

    pub fn is_parsed(&self) -> bool {
        self.shape != ResponseShape::Unparsable
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Keys a decoded object must carry to count as a record.
#[derive(Debug, Clone, Copy)]
pub struct RecordSchema {
    pub required: &'static [&'static str],
}

impl RecordSchema {
    pub const ANY: RecordSchema = RecordSchema { required: &[] };

    pub fn accepts(&self, value: &Value) -> bool {
        match value.as_object() {
            Some(obj) => self.required.iter().all(|key| obj.contains_key(*key)),
            None => false,
        }
    }
}

/// Schema of a rule-based proofreading finding.
pub const FINDING_SCHEMA: RecordSchema = RecordSchema {
    required: &["rule", "original_text", "suggested_change", "rationale"],
};

/// A single rule-based proofreading suggestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub rule: String,
    pub original_text: String,
    pub suggested_change: String,
    pub rationale: String,
}

impl Finding {
    /// Convert decoded records, dropping any whose fields are not strings.
    pub fn from_records(records: &[Record]) -> Vec<Finding> {
        records
            .iter()
            .filter_map(|record| {
                match serde_json::from_value::<Finding>(Value::Object(record.clone())) {
                    Ok(finding) => Some(finding),
                    Err(e) => {
                        tracing::debug!(error = %e, "dropping malformed finding");
                        None
                    }
                }
            })
            .collect()
    }
}

/// Extract records of any shape, discarding the shape information.
pub fn extract(raw: &str) -> Vec<Record> {
    extract_with(raw, &RecordSchema::ANY).records
}

/// Decode `raw` into records that satisfy `schema`.
pub fn extract_with(raw: &str, schema: &RecordSchema) -> Extraction {
    let cleaned = strip_code_fence(raw);

    let value = match serde_json::from_str::<Value>(cleaned) {
        Ok(value) => value,
        Err(_) => match scan_for_array(cleaned) {
            Some(value) => value,
            None => return Extraction::new(ResponseShape::Unparsable, Vec::new()),
        },
    };

    normalize(value, schema)
}

/// Remove a surrounding ```` ```json ```` / ```` ``` ```` fence, if any.
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();

    if let Some(rest) = trimmed.strip_prefix("```") {
        // Drop the info string ("json", "JSON", ...) up to the first newline.
        let body = match rest.find('\n') {
            Some(newline) => &rest[newline + 1..],
            None => rest.trim_start_matches(|c: char| c.is_ascii_alphabetic()),
        };
        let body = body.trim_end();
        let body = body.strip_suffix("```").unwrap_or(body);
        return body.trim();
    }

    // Fenced block with prose before it.
    if let Some(start) = trimmed.find("```json") {
        let after_fence = &trimmed[start + "```json".len()..];
        if let Some(end) = after_fence.find("```") {
            return after_fence[..end].trim();
        }
    }

    trimmed
}

/// Find the first bracket-balanced `[...]` span that parses as JSON.
///
/// One pass over the text. Brackets inside string literals do not count, and
/// a backslash inside a string skips the following character. Quotes in prose
/// outside any bracket are ignored. A span that closes inside a `[` which
/// never closes is kept aside and tried once the text ends.
fn scan_for_array(text: &str) -> Option<Value> {
    let mut open: Vec<usize> = Vec::new();
    // (start, end, depth left after closing), ordered by position, never nested.
    let mut stranded: Vec<(usize, usize, usize)> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, b) in text.bytes().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }

        match b {
            b'"' if !open.is_empty() => in_string = true,
            b'[' => open.push(i),
            b']' => {
                let Some(start) = open.pop() else {
                    continue;
                };
                let depth = open.len();
                // Spans nested in this one are superseded by it.
                while stranded.last().is_some_and(|&(_, _, d)| d > depth) {
                    stranded.pop();
                }
                if depth == 0 {
                    if let Some(value) = parse_span(text, start, i) {
                        return Some(value);
                    }
                } else {
                    stranded.push((start, i, depth));
                }
            }
            _ => {}
        }
    }

    stranded
        .into_iter()
        .find_map(|(start, end, _)| parse_span(text, start, end))
}

fn parse_span(text: &str, start: usize, end: usize) -> Option<Value> {
    serde_json::from_str::<Value>(&text[start..=end]).ok()
}

/// The shapes a decoded value can take, resolved in a fixed order.
enum Decoded<'a> {
    RecordList(&'a [Value]),
    NestedResults(&'a [Value]),
    ResultsObject(&'a [Value]),
    Unrecognized,
}

fn results_list(value: &Value) -> Option<&[Value]> {
    value.get("results")?.as_array().map(Vec::as_slice)
}

fn classify<'a>(value: &'a Value, schema: &RecordSchema) -> Decoded<'a> {
    match value {
        Value::Array(items) => {
            let first = match items.first() {
                // "[]" is a well-formed "nothing found".
                None => return Decoded::RecordList(items),
                Some(first) => first,
            };
            let all_objects = items.iter().all(Value::is_object);
            let wrapper = results_list(first).is_some() && !schema.required.contains(&"results");
            // Non-conforming entries are filtered out later.
            if all_objects && !wrapper && items.iter().any(|item| schema.accepts(item)) {
                Decoded::RecordList(items)
            } else if let Some(nested) = results_list(first) {
                Decoded::NestedResults(nested)
            } else {
                Decoded::Unrecognized
            }
        }
        Value::Object(_) => match results_list(value) {
            Some(list) => Decoded::ResultsObject(list),
            None => Decoded::Unrecognized,
        },
        _ => Decoded::Unrecognized,
    }
}

fn normalize(value: Value, schema: &RecordSchema) -> Extraction {
    let (shape, items) = match classify(&value, schema) {
        Decoded::RecordList(items) => (ResponseShape::RecordList, items),
        Decoded::NestedResults(items) => (ResponseShape::NestedResults, items),
        Decoded::ResultsObject(items) => (ResponseShape::ResultsObject, items),
        Decoded::Unrecognized => {
            tracing::debug!("model response decoded to an unrecognized shape");
            return Extraction::new(ResponseShape::Unrecognized, Vec::new());
        }
    };

    let records: Vec<Record> = items
        .iter()
        .filter(|item| schema.accepts(item))
        .filter_map(|item| item.as_object().cloned())
        .collect();

    if records.len() < items.len() {
        tracing::debug!(
            kept = records.len(),
            dropped = items.len() - records.len(),
            "dropped records missing required keys"
        );
    }

    Extraction::new(shape, records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_records() -> Vec<Record> {
        let value = json!([
            {
                "rule": "Oxford comma",
                "original_text": "red, white and blue",
                "suggested_change": "red, white, and blue",
                "rationale": "House style uses the serial comma."
            },
            {
                "rule": "Numerals",
                "original_text": "5 apples",
                "suggested_change": "five apples",
                "rationale": "Spell out numbers under ten."
            }
        ]);
        match value {
            Value::Array(items) => items
                .into_iter()
                .map(|v| v.as_object().cloned().unwrap())
                .collect(),
            _ => unreachable!(),
        }
    }

    fn as_array(records: &[Record]) -> Value {
        Value::Array(records.iter().cloned().map(Value::Object).collect())
    }

    #[test]
    fn supported_shapes_yield_the_same_records() {
        let records = sample_records();
        let list = as_array(&records);

        let direct = list.to_string();
        let object = json!({ "results": list }).to_string();
        let nested = json!([{ "results": list }]).to_string();
        let fenced = format!("```json\n{}\n```", serde_json::to_string_pretty(&list).unwrap());

        for (raw, shape) in [
            (direct, ResponseShape::RecordList),
            (object, ResponseShape::ResultsObject),
            (nested, ResponseShape::NestedResults),
            (fenced, ResponseShape::RecordList),
        ] {
            let extraction = extract_with(&raw, &FINDING_SCHEMA);
            assert_eq!(extraction.shape, shape, "input: {raw}");
            assert_eq!(extraction.records, records, "input: {raw}");
            assert_eq!(extract(&raw), records, "input: {raw}");
        }
    }

    #[test]
    fn garbage_inputs_yield_nothing() {
        for raw in ["not json at all", "", r#"{"data":"x"}"#, r#"[{"incomplete""#] {
            assert!(extract(raw).is_empty(), "input: {raw:?}");
        }
        assert_eq!(extract_with("not json at all", &RecordSchema::ANY).shape, ResponseShape::Unparsable);
        assert_eq!(
            extract_with(r#"{"data":"x"}"#, &RecordSchema::ANY).shape,
            ResponseShape::Unrecognized
        );
        assert_eq!(
            extract_with(r#"[{"incomplete""#, &RecordSchema::ANY).shape,
            ResponseShape::Unparsable
        );
    }

    #[test]
    fn brackets_and_escapes_inside_strings() {
        let raw = r#"[{"text":"a[0] is \"ok\""}]"#;
        let records = extract(raw);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["text"], "a[0] is \"ok\"");
    }

    #[test]
    fn scan_finds_array_surrounded_by_prose() {
        let raw = r#"Sure! Here are the issues: [{"text":"x[1]] \\ y"}] Let me know."#;
        let extraction = extract_with(raw, &RecordSchema::ANY);
        assert_eq!(extraction.shape, ResponseShape::RecordList);
        assert_eq!(extraction.records[0]["text"], "x[1]] \\ y");
    }

    #[test]
    fn scan_skips_unparsable_candidate() {
        let raw = r#"Legend: [see below] and then [{"text":"second"}]"#;
        let records = extract(raw);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["text"], "second");
    }

    #[test]
    fn scan_recovers_results_object_from_prose() {
        let raw = r#"Result follows {"results": [{"text":"kept"}]} end"#;
        let records = extract(raw);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["text"], "kept");
    }

    #[test]
    fn fence_without_language_tag() {
        let raw = "```\n[{\"text\":\"plain fence\"}]\n```";
        assert_eq!(extract(raw)[0]["text"], "plain fence");
    }

    #[test]
    fn fenced_block_after_prose() {
        let raw = "Here you go:\n```json\n{\"results\": [{\"text\":\"fenced\"}]}\n```\nDone.";
        assert_eq!(extract(raw)[0]["text"], "fenced");
    }

    #[test]
    fn empty_array_is_recognized_but_empty() {
        let extraction = extract_with("  []  ", &FINDING_SCHEMA);
        assert!(extraction.is_recognized());
        assert!(extraction.is_empty());
        assert!(extraction.is_parsed());
    }

    #[test]
    fn records_missing_required_keys_are_dropped() {
        let raw = r#"[
            {"rule":"r","original_text":"o","suggested_change":"s","rationale":"x"},
            {"rule":"only a rule"}
        ]"#;
        let extraction = extract_with(raw, &FINDING_SCHEMA);
        assert_eq!(extraction.shape, ResponseShape::RecordList);
        assert_eq!(extraction.records.len(), 1);
    }

    #[test]
    fn list_led_by_a_summary_keeps_its_findings() {
        let raw = r#"[
            {"summary":"1 issue"},
            {"rule":"r","original_text":"o","suggested_change":"s","rationale":"x"}
        ]"#;
        let extraction = extract_with(raw, &FINDING_SCHEMA);
        assert_eq!(extraction.shape, ResponseShape::RecordList);
        assert_eq!(extraction.records.len(), 1);
        assert_eq!(extraction.records[0]["rule"], "r");
    }

    #[test]
    fn list_without_any_conforming_record_is_unrecognized() {
        let extraction = extract_with(r#"[{"summary":"none"}]"#, &FINDING_SCHEMA);
        assert_eq!(extraction.shape, ResponseShape::Unrecognized);
        assert!(extraction.is_empty());
    }

    #[test]
    fn unclosed_brackets_are_scanned_in_linear_time() {
        let started = std::time::Instant::now();
        let extraction = extract_with(&"[".repeat(200_000), &RecordSchema::ANY);
        assert_eq!(extraction.shape, ResponseShape::Unparsable);
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[test]
    fn array_inside_an_unclosed_bracket_is_found() {
        let raw = format!(r#"{} note [{{"text":"inner"}}] and more"#, "[".repeat(50_000));
        let records = extract(&raw);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["text"], "inner");

        let raw = r#"See [footnote, then [{"text":"a"}, {"text":"b"}] trailing"#;
        let records = extract(raw);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["text"], "b");
    }

    #[test]
    fn list_of_scalars_is_unrecognized() {
        let extraction = extract_with("[1, 2, 3]", &RecordSchema::ANY);
        assert_eq!(extraction.shape, ResponseShape::Unrecognized);
        assert!(extraction.is_empty());
    }

    #[test]
    fn findings_convert_from_records() {
        let findings = Finding::from_records(&sample_records());
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[1].suggested_change, "five apples");
    }

    #[test]
    fn findings_with_non_string_fields_are_skipped() {
        let raw = r#"[{"rule":1,"original_text":"o","suggested_change":"s","rationale":"x"}]"#;
        let extraction = extract_with(raw, &FINDING_SCHEMA);
        assert_eq!(extraction.records.len(), 1);
        assert!(Finding::from_records(&extraction.records).is_empty());
    }
}
