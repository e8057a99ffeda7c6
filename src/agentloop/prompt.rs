//! System-Prompt Composition
//!
//! A system prompt has three parts: the user's instruction, a fixed
//! reasoning-protocol suffix, and the rendered tool catalog (local and
//! remote).  [`PromptBuilder`] assembles them; [`stuck_prompt`] produces
//! the corrective rewrite used by the stuck protocol.

use crate::agentloop::tool_protocol::ToolMetadata;
use crate::agentloop::tool_server::RemoteToolCatalog;

/// Fixed reasoning-protocol suffix for the JSON `Action:` grammar.
pub const REACT_SUFFIX: &str = r#"
[RESPONSE PROTOCOL]

You solve tasks by iterating between reasoning and tool usage.

1. Think about the next step in plain text.
2. To call a tool, respond with exactly one action line:
   Action: {"tool": "<tool_name>", "parameters": {<arguments>}}
   Then STOP and wait for the observation. Observations arrive as user
   messages beginning with "OBSERVATION".
3. When you have enough information, finish with:
   Final Answer: <your answer>

Rules:
- Only call tools listed in the tools registry below, with the documented
  parameters.
- Never invent observations; wait for the real tool result.
- Exactly one action or one final answer per response.
"#;

/// Fixed reasoning-protocol suffix for the XML `<tool_call>` grammar.
pub const XML_REACT_SUFFIX: &str = r#"
[RESPONSE PROTOCOL]

You solve tasks by iterating between reasoning and tool usage. All
responses must use XML tags.

1. Put reasoning inside <thought>...</thought>.
2. To call a tool respond with:
   <tool_call>
     <tool_name>name</tool_name>
     <parameters><param>value</param></parameters>
   </tool_call>
   Then STOP and wait for the observation.
3. Finish with <final_answer>...</final_answer>.

Rules:
- Only call tools listed in the tools registry below.
- Never invent observations; wait for the real tool result.
- Exactly one tool call or one final answer per response.
"#;

/// Render local and remote tool descriptors as the markdown catalog
/// embedded in the system prompt.
pub fn render_tool_catalog(local: &[ToolMetadata], remote: &RemoteToolCatalog) -> String {
    let mut sections = Vec::new();

    let mut render = |tool: &ToolMetadata, origin: &str| {
        let mut section = format!("### `{}`\n{}", tool.name, tool.description);
        if !origin.is_empty() {
            section.push_str(&format!("\n_(served by {})_", origin));
        }
        if !tool.parameters.is_empty() {
            section.push_str("\n\n**Parameters:**\n");
            section.push_str("| Name | Type | Required | Description |\n");
            section.push_str("|------|------|----------|-------------|\n");
            for param in &tool.parameters {
                section.push_str(&format!(
                    "| `{}` | `{}` | {} | {} |\n",
                    param.name,
                    serde_json::to_value(param.param_type)
                        .ok()
                        .and_then(|v| v.as_str().map(|s| s.to_string()))
                        .unwrap_or_else(|| "any".to_string()),
                    if param.required { "yes" } else { "no" },
                    param.description.as_deref().unwrap_or("No description"),
                ));
            }
        }
        sections.push(section);
    };

    // Remote tools first, matching dispatch precedence.
    let mut servers: Vec<&String> = remote.keys().collect();
    servers.sort();
    for server in servers {
        for tool in &remote[server] {
            render(tool, server);
        }
    }
    for tool in local {
        render(tool, "");
    }

    sections.join("\n\n")
}

/// Composes the system prompt from an instruction, a protocol suffix, and
/// the tool catalog.
pub struct PromptBuilder {
    suffix: &'static str,
}

impl PromptBuilder {
    /// Builder using the JSON `Action:` protocol suffix.
    pub fn new() -> Self {
        Self {
            suffix: REACT_SUFFIX,
        }
    }

    /// Builder using the XML `<tool_call>` protocol suffix.
    pub fn xml() -> Self {
        Self {
            suffix: XML_REACT_SUFFIX,
        }
    }

    /// Assemble `instruction + suffix + tool catalog`.
    pub fn build(
        &self,
        instruction: &str,
        local_tools: &[ToolMetadata],
        remote_catalog: &RemoteToolCatalog,
    ) -> String {
        let catalog = render_tool_catalog(local_tools, remote_catalog);
        let mut prompt = String::with_capacity(
            instruction.len() + self.suffix.len() + catalog.len() + 64,
        );
        prompt.push_str(instruction.trim());
        prompt.push('\n');
        prompt.push_str(self.suffix);
        prompt.push_str("\n[AVAILABLE TOOLS REGISTRY]\n\n");
        if catalog.is_empty() {
            prompt.push_str("(no tools available)\n");
        } else {
            prompt.push_str(&catalog);
            prompt.push('\n');
        }
        prompt
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Rewrite a system prompt after the loop detector fires.
///
/// The original prompt is kept, headed by a corrective block telling the
/// model its current approach is not working.  `message_stuck` selects the
/// parse-failure wording over the tool-loop wording.
pub fn stuck_prompt(original: &str, message_stuck: bool) -> String {
    let guidance = if message_stuck {
        "IMPORTANT: Your recent responses could not be interpreted and the \
         same failure keeps repeating. Re-read the response protocol below, \
         fix your output format, or explain the problem to the user instead \
         of retrying the same output."
    } else {
        "IMPORTANT: Your previous approach is not working — the same tool \
         call keeps producing the same result. Try a different tool or a \
         different approach, break the task into smaller steps, or explain \
         the issue to the user."
    };
    format!("{}\n\n{}", guidance, original)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentloop::tool_protocol::{ToolParameter, ToolParameterType};

    #[test]
    fn build_contains_all_three_parts() {
        let local = vec![ToolMetadata::new("add", "Adds two numbers").with_parameter(
            ToolParameter::new("a", ToolParameterType::Number)
                .with_description("Left operand")
                .required(),
        )];
        let prompt = PromptBuilder::new().build("You are a math helper.", &local, &RemoteToolCatalog::new());

        assert!(prompt.starts_with("You are a math helper."));
        assert!(prompt.contains("[RESPONSE PROTOCOL]"));
        assert!(prompt.contains("[AVAILABLE TOOLS REGISTRY]"));
        assert!(prompt.contains("### `add`"));
        assert!(prompt.contains("| `a` | `number` | yes | Left operand |"));
    }

    #[test]
    fn remote_tools_are_listed_with_their_server() {
        let mut remote = RemoteToolCatalog::new();
        remote.insert(
            "weather".to_string(),
            vec![ToolMetadata::new("forecast", "Weather forecast")],
        );
        let catalog = render_tool_catalog(&[], &remote);
        assert!(catalog.contains("### `forecast`"));
        assert!(catalog.contains("_(served by weather)_"));
    }

    #[test]
    fn empty_catalog_is_stated() {
        let prompt = PromptBuilder::new().build("Do things.", &[], &RemoteToolCatalog::new());
        assert!(prompt.contains("(no tools available)"));
    }

    #[test]
    fn stuck_prompt_keeps_the_original() {
        let rewritten = stuck_prompt("You are a helper.", false);
        assert!(rewritten.contains("not working"));
        assert!(rewritten.ends_with("You are a helper."));
    }
}
