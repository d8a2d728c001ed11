//! MCP server over line-delimited JSON-RPC 2.0 on stdin/stdout.
//!
//! One record per line, requests `{jsonrpc, id, method, params}`, replies
//! mirroring `id`. Exactly one tool is exposed, `execute`, whose single
//! parameter is the agent script source; everything else composes inside
//! the sandbox. Replies larger than the configured limit are cut and
//! given a guidance footer pointing at the narrower file APIs.

use std::sync::Arc;

use anyhow::Result;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::app::App;
use crate::sandbox;

const SERVER_NAME: &str = "opensrc";

/// Run the server until stdin closes or a termination signal arrives.
/// On the way out the manifest is persisted.
pub async fn serve(app: Arc<App>) -> Result<()> {
    // Anything fetched but never checkpointed resumes indexing now.
    app.enqueue_unindexed().await?;
    app.logger.info("server ready");

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let mut stdout = tokio::io::stdout();

    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }

                let response = match serde_json::from_str::<Value>(&line) {
                    Ok(message) => handle_message(&app, message).await,
                    Err(e) => Some(jsonrpc_error(
                        Value::Null,
                        -32700,
                        &format!("parse error: {}", e),
                    )),
                };

                if let Some(payload) = response {
                    let mut out = serde_json::to_string(&payload)?;
                    out.push('\n');
                    stdout.write_all(out.as_bytes()).await?;
                    stdout.flush().await?;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
            _ = sigterm.recv() => break,
        }
    }

    app.shutdown();
    Ok(())
}

async fn handle_message(app: &Arc<App>, message: Value) -> Option<Value> {
    let id = message.get("id").cloned();
    let method = message.get("method").and_then(|m| m.as_str());

    let Some(method) = method else {
        return id.map(|id| jsonrpc_error(id, -32600, "invalid request"));
    };

    match method {
        "initialize" => {
            let id = id?;
            Some(jsonrpc_result(id, initialize_result(&message)))
        }
        "notifications/initialized" => None,
        "ping" => id.map(|id| jsonrpc_result(id, json!({}))),
        "tools/list" => {
            let id = id?;
            Some(jsonrpc_result(id, json!({ "tools": [tool_spec()] })))
        }
        "tools/call" => {
            let id = id?;
            Some(handle_tool_call(app, id, &message).await)
        }
        "resources/list" => id.map(|id| jsonrpc_result(id, json!({ "resources": [] }))),
        "prompts/list" => id.map(|id| jsonrpc_result(id, json!({ "prompts": [] }))),
        _ => id.map(|id| jsonrpc_error(id, -32601, "method not found")),
    }
}

fn initialize_result(message: &Value) -> Value {
    let protocol = message
        .get("params")
        .and_then(|p| p.get("protocolVersion"))
        .cloned()
        .unwrap_or_else(|| Value::String("2024-11-05".to_string()));

    json!({
        "protocolVersion": protocol,
        "capabilities": { "tools": {} },
        "serverInfo": {
            "name": SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        },
        "instructions": "Use the execute tool with a Lua script. The opensrc table exposes: \
list(), has(name, version?), get(name), files(source, glob?), tree(source, {depth, pattern}), \
read(source, path), read_many(source, paths), grep(pattern, {sources, include, maxResults}), \
ast_grep(source, pattern, {glob, lang, limit}), semantic_search(query, {sources, topK}), \
resolve(spec), fetch(specs, {modify}), remove(names), clean(filter). \
Fetch sources first (e.g. fetch('zod') or fetch('github:owner/repo')), then query them. \
semantic_search returns {error = 'indexing'} while a source is still being ingested; retry shortly.",
    })
}

fn tool_spec() -> Value {
    json!({
        "name": "execute",
        "description": "Run a Lua script against fetched third-party source code. \
The script composes the opensrc API (file listing, regex grep, structural ast_grep, \
semantic search, fetch) server-side and returns only the final value.",
        "inputSchema": {
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "Lua script source. Either a chunk returning a value or an expression evaluating to a function, which is invoked.",
                }
            },
            "required": ["code"]
        }
    })
}

async fn handle_tool_call(app: &Arc<App>, id: Value, message: &Value) -> Value {
    let params = message.get("params").cloned().unwrap_or(Value::Null);
    let name = params.get("name").and_then(|n| n.as_str()).unwrap_or("");
    if name != "execute" {
        return jsonrpc_error(id, -32602, &format!("unknown tool: {}", name));
    }

    let Some(code) = params
        .get("arguments")
        .and_then(|a| a.get("code"))
        .and_then(|c| c.as_str())
    else {
        return jsonrpc_error(id, -32602, "execute requires a 'code' string argument");
    };

    match sandbox::execute(Arc::clone(app), code.to_string()).await {
        Ok(value) => {
            let text = match value {
                Value::String(s) => s,
                Value::Null => "null".to_string(),
                other => serde_json::to_string(&other).unwrap_or_else(|_| other.to_string()),
            };
            let text = truncate_result(&text, app.config.max_result_chars);
            jsonrpc_result(id, json!({ "content": [{"type": "text", "text": text}] }))
        }
        Err(e) => {
            let message = e.to_string();
            app.logger.error(&format!("script failed: {}", message));
            jsonrpc_result(
                id,
                json!({
                    "content": [{"type": "text", "text": format!("Error: {}", message)}],
                    "isError": true,
                }),
            )
        }
    }
}

/// Cut a reply at `max_chars` characters and append the guidance footer.
pub fn truncate_result(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!(
        "{}\n--- TRUNCATED ---\nOutput exceeded {} characters. Narrow the query, or use \
opensrc.files to list paths and opensrc.read to fetch only the files you need.",
        cut, max_chars
    )
}

fn jsonrpc_result(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn jsonrpc_error(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}
