use std::collections::BTreeMap;

use crate::error::ProxyError;

/// Inputs for composing a session's `instructions` string.
#[derive(Debug, Default, Clone)]
pub struct InstructionContext {
    pub server_names: Vec<String>,
    pub filter_context: Option<String>,
    pub per_server: BTreeMap<String, String>,
}

const DEFAULT_TEMPLATE: &str = "\
This server aggregates {{server_count}} MCP server(s): {{server_names}}.\n\
{{filter_context}}\
Tool, resource, and prompt requests are routed to the server that owns them.\n\
\n\
{{server_instructions}}";

const NO_SERVERS_TEMPLATE: &str = "\
No MCP servers are currently available to this session. Servers may still \
be connecting, or the session filter matches none of them.\n";

/// Render a session's instructions. A custom template that fails to render
/// falls back to the default.
pub fn render(custom_template: Option<&str>, ctx: &InstructionContext) -> String {
    if ctx.server_names.is_empty() {
        return NO_SERVERS_TEMPLATE.to_string();
    }
    if let Some(template) = custom_template {
        match render_template(template, ctx) {
            Ok(text) => return text,
            Err(e) => {
                tracing::warn!(target = "instructions", "custom template rejected: {e}");
            }
        }
    }
    render_template(DEFAULT_TEMPLATE, ctx).expect("default template renders")
}

/// Substitute `{{placeholder}}` occurrences. Unknown placeholders and
/// unbalanced braces are errors so a broken custom template is detected
/// rather than emitted half-rendered.
fn render_template(template: &str, ctx: &InstructionContext) -> Result<String, ProxyError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(ProxyError::Validation("unbalanced '{{' in template".into()));
        };
        let key = after[..end].trim();
        match key {
            "server_count" => out.push_str(&ctx.server_names.len().to_string()),
            "server_names" => out.push_str(&ctx.server_names.join(", ")),
            "filter_context" => {
                if let Some(filter) = &ctx.filter_context {
                    out.push_str(&format!("Session filter: {filter}.\n"));
                }
            }
            "server_instructions" => out.push_str(&render_server_blocks(&ctx.per_server)),
            other => {
                return Err(ProxyError::Validation(format!(
                    "unknown template placeholder '{other}'"
                )));
            }
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Per-server instructions in delimited blocks keyed by server name. The
/// closing sentinel is escaped out of the body so a server cannot terminate
/// its own block early.
fn render_server_blocks(per_server: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (name, text) in per_server {
        let body = text.replace("</server>", "<\\/server>");
        out.push_str(&format!("<server name=\"{name}\">\n{body}\n</server>\n"));
    }
    out
}
