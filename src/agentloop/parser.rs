//! Model-Output Parsing
//!
//! Turns a raw LLM response into one of three things: a final answer, a
//! structured tool action, or a parse error.  Two grammars are supported —
//! the JSON `Action:` protocol (default) and an XML `<tool_call>` variant
//! for providers that emit XML blocks.  One parser is active per agent,
//! chosen at construction.
//!
//! # JSON grammar
//!
//! - A `Final Answer:` or `Answer:` token (case-insensitive) ends the run;
//!   everything after the token is the answer.
//! - Otherwise an `Action:` token introduces a JSON object located by brace
//!   matching.  JSON-style line comments and trailing commas — common LLM
//!   quirks — are stripped before the payload is handed to the dispatcher.
//! - Anything else is treated as a final answer verbatim.

use serde_json::Value as JsonValue;

/// Which response grammar an agent speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserKind {
    /// `Final Answer:` / `Action: {...}` (the default).
    Json,
    /// `<final_answer>` / `<tool_call>` blocks.
    Xml,
}

impl Default for ParserKind {
    fn default() -> Self {
        ParserKind::Json
    }
}

/// Result of parsing one model response.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedResponse {
    /// The model produced its final answer.
    Answer(String),
    /// The model requested a tool call; the payload is the extracted JSON
    /// text (`{"tool": ..., "parameters": {...}}`).
    Action(String),
    /// The response could not be interpreted.
    ParseError(String),
}

/// A decoded tool action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    /// Requested tool name.
    pub tool: String,
    /// Arguments for the tool.
    pub parameters: JsonValue,
}

/// Parse a response with the given grammar.
pub fn parse_response(kind: ParserKind, response: &str) -> ParsedResponse {
    match kind {
        ParserKind::Json => parse_json_response(response),
        ParserKind::Xml => parse_xml_response(response),
    }
}

/// Decode an [`ParsedResponse::Action`] payload into tool name + arguments.
pub fn decode_action(payload: &str) -> Result<ActionRequest, String> {
    let value: JsonValue =
        serde_json::from_str(payload).map_err(|e| format!("Invalid JSON in tool call: {}", e))?;
    let tool = value
        .get("tool")
        .and_then(|t| t.as_str())
        .unwrap_or("")
        .trim()
        .to_string();
    let parameters = value
        .get("parameters")
        .cloned()
        .unwrap_or_else(|| JsonValue::Object(serde_json::Map::new()));
    Ok(ActionRequest { tool, parameters })
}

fn parse_json_response(response: &str) -> ParsedResponse {
    // Final answer present?  Split on the last occurrence of either token.
    if let Some(answer) = split_after_answer_token(response) {
        return ParsedResponse::Answer(answer.trim().to_string());
    }

    if response.contains("Action") {
        return match extract_action_json(response) {
            Ok(json) => ParsedResponse::Action(json),
            Err(reason) => ParsedResponse::ParseError(reason),
        };
    }

    // Fallback: the whole response is the answer.
    ParsedResponse::Answer(response.trim().to_string())
}

/// Locate the last `Final Answer:`/`Answer:` token (case-insensitive) and
/// return the tail after it.  Matching is byte-wise ASCII, so multi-byte
/// characters elsewhere in the response cannot shift the split point.
fn split_after_answer_token(response: &str) -> Option<&str> {
    let bytes = response.as_bytes();
    let mut tail_start: Option<usize> = None;
    for token in &["final answer:", "answer:"] {
        let token = token.as_bytes();
        if bytes.len() < token.len() {
            continue;
        }
        for i in 0..=bytes.len() - token.len() {
            if bytes[i..i + token.len()].eq_ignore_ascii_case(token) {
                let end = i + token.len();
                tail_start = Some(tail_start.map_or(end, |best| best.max(end)));
            }
        }
    }
    tail_start.map(|start| &response[start..])
}

/// Extract the JSON object following `Action:` via brace matching.
fn extract_action_json(response: &str) -> Result<String, String> {
    let action_start = response
        .find("Action:")
        .ok_or_else(|| "No 'Action:' section found in response".to_string())?;
    let action_text = &response[action_start + "Action:".len()..];

    let json_start = action_text
        .find('{')
        .ok_or_else(|| "No JSON object found after 'Action:'".to_string())?;
    let json_text = &action_text[json_start..];

    // Track balanced braces, skipping string literals.
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut end = None;
    for (i, ch) in json_text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(i + ch.len_utf8());
                    break;
                }
            }
            _ => {}
        }
    }
    let end = end.ok_or_else(|| "Unbalanced JSON braces".to_string())?;

    let mut json = strip_json_comments(&json_text[..end]);
    json = strip_trailing_commas(&json);
    log::debug!("extracted action JSON: {}", json);
    Ok(json)
}

/// Remove `// line comments` outside string literals.
pub(crate) fn strip_json_comments(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    let mut chars = json.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;
    while let Some(ch) = chars.next() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            '/' if chars.peek() == Some(&'/') => {
                // Drop everything up to (but not including) the newline.
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            _ => out.push(ch),
        }
    }
    out
}

/// Remove commas that directly precede a closing `]` or `}`.
pub(crate) fn strip_trailing_commas(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    let mut in_string = false;
    let mut escaped = false;
    for ch in json.chars() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            ']' | '}' => {
                // Drop a trailing comma (and the whitespace after it).
                while matches!(out.chars().last(), Some(c) if c.is_whitespace()) {
                    out.pop();
                }
                if out.ends_with(',') {
                    out.pop();
                }
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}

// ---- XML variant ----

fn parse_xml_response(response: &str) -> ParsedResponse {
    if let Some(answer) = extract_tag(response, "final_answer") {
        return ParsedResponse::Answer(answer.trim().to_string());
    }

    if response.contains("<tool_call>") {
        return match extract_xml_tool_call(response) {
            Ok(json) => ParsedResponse::Action(json),
            Err(reason) => ParsedResponse::ParseError(reason),
        };
    }

    ParsedResponse::Answer(response.trim().to_string())
}

/// Content of the first `<tag>…</tag>` block, if present.
fn extract_tag<'a>(text: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = text.find(&open)? + open.len();
    let end = start + text[start..].find(&close)?;
    Some(&text[start..end])
}

fn extract_xml_tool_call(response: &str) -> Result<String, String> {
    let block = extract_tag(response, "tool_call")
        .ok_or_else(|| "Unterminated <tool_call> block".to_string())?;
    let tool = extract_tag(block, "tool_name")
        .ok_or_else(|| "Missing <tool_name> in tool call".to_string())?
        .trim();

    let mut parameters = serde_json::Map::new();
    if let Some(params_block) = extract_tag(block, "parameters") {
        let mut rest = params_block;
        while let Some(open_start) = rest.find('<') {
            let after = &rest[open_start + 1..];
            let name_end = match after.find('>') {
                Some(end) => end,
                None => break,
            };
            let name = &after[..name_end];
            if name.starts_with('/') {
                rest = &after[name_end + 1..];
                continue;
            }
            let close = format!("</{}>", name);
            let value_start = open_start + 1 + name_end + 1;
            let value_end = rest[value_start..]
                .find(&close)
                .ok_or_else(|| format!("Unterminated <{}> parameter", name))?;
            let raw_value = rest[value_start..value_start + value_end].trim();
            // Numbers and booleans come through typed; everything else is a
            // string.
            let value = serde_json::from_str::<JsonValue>(raw_value)
                .ok()
                .filter(|v| v.is_number() || v.is_boolean())
                .unwrap_or_else(|| JsonValue::String(raw_value.to_string()));
            parameters.insert(name.to_string(), value);
            rest = &rest[value_start + value_end + close.len()..];
        }
    }

    let action = serde_json::json!({
        "tool": tool,
        "parameters": parameters,
    });
    Ok(action.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_answer_token_wins() {
        let parsed = parse_response(
            ParserKind::Json,
            "Thought: done.\nFinal Answer: The total is 5.",
        );
        assert_eq!(parsed, ParsedResponse::Answer("The total is 5.".into()));
    }

    #[test]
    fn answer_token_is_case_insensitive() {
        let parsed = parse_response(ParserKind::Json, "ANSWER:   42");
        assert_eq!(parsed, ParsedResponse::Answer("42".into()));
    }

    #[test]
    fn action_json_is_extracted_with_brace_matching() {
        let parsed = parse_response(
            ParserKind::Json,
            r#"Thought: I should add.
Action: {"tool": "add", "parameters": {"a": 2, "b": 3}}
(waiting for observation)"#,
        );
        match parsed {
            ParsedResponse::Action(json) => {
                let action = decode_action(&json).unwrap();
                assert_eq!(action.tool, "add");
                assert_eq!(action.parameters["a"], 2);
            }
            other => panic!("expected action, got {:?}", other),
        }
    }

    #[test]
    fn comments_and_trailing_commas_are_stripped() {
        let parsed = parse_response(
            ParserKind::Json,
            "Action: {\"tool\": \"add\", // the math tool\n\"parameters\": {\"a\": 1, \"b\": 2,},}",
        );
        match parsed {
            ParsedResponse::Action(json) => {
                let action = decode_action(&json).unwrap();
                assert_eq!(action.tool, "add");
                assert_eq!(action.parameters["b"], 2);
            }
            other => panic!("expected action, got {:?}", other),
        }
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_the_scanner() {
        let parsed = parse_response(
            ParserKind::Json,
            r#"Action: {"tool": "echo", "parameters": {"text": "look: { nested }"}}"#,
        );
        match parsed {
            ParsedResponse::Action(json) => {
                let action = decode_action(&json).unwrap();
                assert_eq!(action.parameters["text"], "look: { nested }");
            }
            other => panic!("expected action, got {:?}", other),
        }
    }

    #[test]
    fn unbalanced_braces_are_a_parse_error() {
        let parsed = parse_response(ParserKind::Json, r#"Action: {"tool": "add""#);
        assert!(matches!(parsed, ParsedResponse::ParseError(_)));
    }

    #[test]
    fn action_without_json_is_a_parse_error() {
        let parsed = parse_response(ParserKind::Json, "Action: just do something");
        assert!(matches!(parsed, ParsedResponse::ParseError(_)));
    }

    #[test]
    fn plain_text_falls_back_to_answer() {
        let parsed = parse_response(ParserKind::Json, "  I don't need any tools for this.  ");
        assert_eq!(
            parsed,
            ParsedResponse::Answer("I don't need any tools for this.".into())
        );
    }

    #[test]
    fn xml_final_answer() {
        let parsed = parse_response(
            ParserKind::Xml,
            "<thought>done</thought><final_answer>It is 5.</final_answer>",
        );
        assert_eq!(parsed, ParsedResponse::Answer("It is 5.".into()));
    }

    #[test]
    fn xml_tool_call_maps_onto_the_same_action_shape() {
        let parsed = parse_response(
            ParserKind::Xml,
            "<tool_call><tool_name>add</tool_name><parameters><a>2</a><b>3</b></parameters></tool_call>",
        );
        match parsed {
            ParsedResponse::Action(json) => {
                let action = decode_action(&json).unwrap();
                assert_eq!(action.tool, "add");
                assert_eq!(action.parameters["a"], 2);
                assert_eq!(action.parameters["b"], 3);
            }
            other => panic!("expected action, got {:?}", other),
        }
    }

    #[test]
    fn xml_string_parameters_stay_strings() {
        let parsed = parse_response(
            ParserKind::Xml,
            "<tool_call><tool_name>greet</tool_name><parameters><name>Ada</name></parameters></tool_call>",
        );
        match parsed {
            ParsedResponse::Action(json) => {
                let action = decode_action(&json).unwrap();
                assert_eq!(action.parameters["name"], "Ada");
            }
            other => panic!("expected action, got {:?}", other),
        }
    }
}
