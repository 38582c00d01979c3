//! Mid-step user-assistance requests.
//!
//! A step that needs the user to disambiguate emits a sentinel header
//! followed by a JSON object.  Parsing is tolerant: brace matching around
//! the marker first, then a numbered-list text fallback.  Selection matching
//! accepts numbers, ordinal words (English and Russian), option ids, label
//! substrings, and substrings of the option's data fields, in that order.

use std::collections::HashSet;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use maestro_session::AssistanceOption;

/// Sentinel header a step emits to pause for user disambiguation.
pub const ASSISTANCE_MARKER: &str = "🔍 USER ASSISTANCE REQUEST";

/// Sentinel a step emits when it cannot proceed at all; the workflow pauses
/// instead of running further steps.
pub const CRITICAL_FAILURE_MARKER: &str = "🛑 USER HELP REQUIRED";

#[derive(Debug, Clone, PartialEq)]
pub struct AssistanceRequest {
    pub question: String,
    pub options: Vec<AssistanceOption>,
    pub context: Value,
}

/// Scan a step result for an assistance request.  Returns `None` when the
/// marker is absent or nothing parseable follows it.
pub fn parse_assistance_request(step_result: &str) -> Option<AssistanceRequest> {
    if !step_result.contains(ASSISTANCE_MARKER) {
        return None;
    }

    if let Some(request) = parse_json_form(step_result) {
        return Some(request);
    }
    parse_text_form(step_result)
}

/// JSON form: the marker appears as a key (or header directly above an
/// object).  Brace-match the nearest object and read `question`/`options`.
fn parse_json_form(step_result: &str) -> Option<AssistanceRequest> {
    let marker_pos = step_result.find(ASSISTANCE_MARKER)?;

    // The object either wraps the marker key or starts after the header.
    let start = step_result[..marker_pos]
        .rfind('{')
        .or_else(|| step_result[marker_pos..].find('{').map(|p| p + marker_pos))?;

    let bytes = step_result.as_bytes();
    let mut depth = 0usize;
    let mut end = None;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    end = Some(start + offset + 1);
                    break;
                }
            }
            _ => {}
        }
    }
    let end = end?;

    let json_str = step_result[start..end].replace(
        &format!("\"{ASSISTANCE_MARKER}\""),
        "\"user_assistance_request\"",
    );
    let parsed: Value = serde_json::from_str(&json_str).ok()?;
    // Either `{"user_assistance_request": {...}}` or the body itself.
    let body = parsed.get("user_assistance_request").unwrap_or(&parsed);

    let question = body.get("question")?.as_str()?.to_string();
    let raw_options = body.get("options")?.as_array()?.clone();
    let options = dedup_options(
        raw_options
            .into_iter()
            .filter_map(|opt| {
                Some(AssistanceOption {
                    id: option_id(&opt)?,
                    label: opt.get("label").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                    description: opt.get("description").and_then(|v| v.as_str()).map(ToString::to_string),
                    data: opt.get("data").cloned(),
                })
            })
            .collect(),
    );
    if options.is_empty() {
        return None;
    }

    Some(AssistanceRequest {
        question,
        options,
        context: body.get("context").cloned().unwrap_or(Value::Object(Default::default())),
    })
}

fn option_id(opt: &Value) -> Option<String> {
    match opt.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Text fallback: a "Question:" line followed by a numbered list.
fn parse_text_form(step_result: &str) -> Option<AssistanceRequest> {
    let question_re = Regex::new(r"(?i)(?:Question|Вопрос):\s*(.+)").expect("static regex");
    let question = question_re
        .captures(step_result)
        .map(|c| c[1].trim().to_string())
        .unwrap_or_else(|| "Choose an option".to_string());

    let option_re = Regex::new(r"(?m)^\s*(\d+)\.\s+(.+)$").expect("static regex");
    let options: Vec<AssistanceOption> = option_re
        .captures_iter(step_result)
        .map(|c| AssistanceOption {
            id: c[1].to_string(),
            label: c[2].trim().to_string(),
            description: None,
            data: None,
        })
        .collect();

    if options.is_empty() {
        debug!("assistance marker present but no options parsed");
        return None;
    }

    Some(AssistanceRequest {
        question,
        options: dedup_options(options),
        context: Value::Object(Default::default()),
    })
}

fn dedup_options(options: Vec<AssistanceOption>) -> Vec<AssistanceOption> {
    let mut seen = HashSet::new();
    options.into_iter().filter(|opt| seen.insert(opt.id.clone())).collect()
}

/// Ordinal words, bilingual, index 0-based.
const ORDINALS: &[(&str, usize)] = &[
    ("первый", 0), ("первая", 0), ("первое", 0), ("first", 0),
    ("второй", 1), ("вторая", 1), ("второе", 1), ("second", 1),
    ("третий", 2), ("третья", 2), ("третье", 2), ("third", 2),
    ("четвертый", 3), ("четвёртый", 3), ("fourth", 3),
    ("пятый", 4), ("пятая", 4), ("fifth", 4),
];

/// Match a free-text user reply against the offered options.
pub fn parse_user_selection<'a>(
    user_response: &str,
    options: &'a [AssistanceOption],
) -> Option<&'a AssistanceOption> {
    if options.is_empty() {
        return None;
    }
    let response = user_response.trim().to_lowercase();
    if response.is_empty() {
        return None;
    }

    // 1. Leading integer is a 1-based ordinal.
    let digits: String = response.chars().take_while(|c| c.is_ascii_digit()).collect();
    if !digits.is_empty() {
        if let Ok(n) = digits.parse::<usize>() {
            if n >= 1 && n <= options.len() {
                return Some(&options[n - 1]);
            }
        }
    }

    // 2. Ordinal words.
    for (word, index) in ORDINALS {
        if response.contains(word) && *index < options.len() {
            return Some(&options[*index]);
        }
    }

    // 3. Exact option id.
    if let Some(found) = options.iter().find(|opt| opt.id.to_lowercase() == response) {
        return Some(found);
    }

    // 4. Label substring, either direction.
    if let Some(found) = options.iter().find(|opt| {
        let label = opt.label.to_lowercase();
        !label.is_empty() && (label.contains(&response) || response.contains(&label))
    }) {
        return Some(found);
    }

    // 5. Substring of any string field in the option's data.
    options.iter().find(|opt| {
        opt.data
            .as_ref()
            .and_then(|d| d.as_object())
            .is_some_and(|map| {
                map.values()
                    .filter_map(|v| v.as_str())
                    .any(|v| v.to_lowercase().contains(&response))
            })
    })
}
