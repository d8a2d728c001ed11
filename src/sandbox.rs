//! Sandboxed Lua runtime for agent scripts.
//!
//! Each `execute` call gets a fresh Lua 5.4 VM with the dangerous
//! standard libraries removed and exactly three things injected: the
//! read-only `opensrc` API table, a `json` encode/parse pair, and a
//! `print` that routes to the debug log. Timers, network, subprocess,
//! filesystem, and module loading never reach the VM.
//!
//! The script source is evaluated as an expression; if it yields a
//! function the host invokes it, otherwise the chunk's return value is
//! the result. A wall-clock deadline is enforced two ways: a VM
//! instruction hook fires every few thousand instructions, and every
//! host bridge function re-checks the deadline on entry, so a script
//! cannot hide inside a long host call.
//!
//! The VM runs on a blocking thread; bridge functions that need the
//! async core (semantic search, fetch, store access) block on the
//! runtime handle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use mlua::prelude::*;

use crate::app::{App, CleanFilter};
use crate::files;
use crate::query::{self, AstGrepParams, GrepParams, SemanticParams};

/// Message fragment the server matches to classify timeouts.
pub const TIMEOUT_MESSAGE: &str = "Execution timeout";

/// Run one agent script to completion and return its result as JSON.
pub async fn execute(app: Arc<App>, code: String) -> Result<serde_json::Value> {
    let handle = tokio::runtime::Handle::current();
    let timeout = Duration::from_secs(app.config.script_timeout_secs);

    tokio::task::spawn_blocking(move || run_script(app, handle, &code, timeout))
        .await
        .map_err(|e| anyhow!("script task panicked: {}", e))?
}

fn run_script(
    app: Arc<App>,
    handle: tokio::runtime::Handle,
    code: &str,
    timeout: Duration,
) -> Result<serde_json::Value> {
    let lua = Lua::new();
    let deadline = Instant::now() + timeout;

    // Instruction hook: the deadline applies to the combined synchronous
    // and asynchronous lifetime of the call.
    let timeout_secs = timeout.as_secs();
    lua.set_hook(
        mlua::HookTriggers::new().every_nth_instruction(10_000),
        move |_lua, _debug| {
            if Instant::now() > deadline {
                Err(mlua::Error::RuntimeError(format!(
                    "{} after {} seconds",
                    TIMEOUT_MESSAGE, timeout_secs
                )))
            } else {
                Ok(mlua::VmState::Continue)
            }
        },
    );

    sandbox_globals(&lua).map_err(|e| anyhow!("sandbox setup failed: {}", e))?;
    register_json_api(&lua).map_err(|e| anyhow!("sandbox setup failed: {}", e))?;
    register_print(&lua, &app).map_err(|e| anyhow!("sandbox setup failed: {}", e))?;
    register_opensrc_api(&lua, &app, &handle, deadline)
        .map_err(|e| anyhow!("sandbox setup failed: {}", e))?;

    let value: LuaValue = lua
        .load(code)
        .set_name("agent script")
        .eval()
        .map_err(|e| anyhow!("{}", flatten_lua_error(&e)))?;

    // An expression evaluating to a function is the callable form; the
    // host invokes it with no arguments.
    let result = match value {
        LuaValue::Function(f) => f
            .call::<LuaValue>(())
            .map_err(|e| anyhow!("{}", flatten_lua_error(&e)))?,
        other => other,
    };

    lua_value_to_json(result).map_err(|e| anyhow!("result conversion failed: {}", e))
}

/// Lua runtime errors wrap their cause several levels deep; surface the
/// innermost message so the agent sees `Execution timeout ...` rather
/// than a traceback.
fn flatten_lua_error(error: &mlua::Error) -> String {
    match error {
        mlua::Error::CallbackError { cause, .. } => flatten_lua_error(cause),
        mlua::Error::RuntimeError(msg) => msg.lines().next().unwrap_or(msg).to_string(),
        other => other.to_string(),
    }
}

/// Remove every ambient capability from the VM globals.
fn sandbox_globals(lua: &Lua) -> LuaResult<()> {
    let globals = lua.globals();
    for name in [
        "os",
        "io",
        "debug",
        "loadfile",
        "dofile",
        "load",
        "require",
        "package",
        "collectgarbage",
    ] {
        globals.set(name, LuaValue::Nil)?;
    }
    Ok(())
}

/// Wrap a table in a read-only proxy: lookups pass through, writes fail.
fn freeze_table(lua: &Lua, table: LuaTable) -> LuaResult<LuaTable> {
    let proxy = lua.create_table()?;
    let meta = lua.create_table()?;
    meta.set("__index", table)?;
    meta.set(
        "__newindex",
        lua.create_function(
            |_lua, (_table, _key, _value): (LuaValue, LuaValue, LuaValue)| -> LuaResult<()> {
                Err(mlua::Error::RuntimeError(
                    "attempt to modify a read-only table".to_string(),
                ))
            },
        )?,
    )?;
    meta.set("__metatable", false)?;
    proxy.set_metatable(Some(meta));
    Ok(proxy)
}

fn register_json_api(lua: &Lua) -> LuaResult<()> {
    let json_table = lua.create_table()?;

    json_table.set(
        "parse",
        lua.create_function(|lua, s: String| {
            let value: serde_json::Value = serde_json::from_str(&s)
                .map_err(|e| mlua::Error::external(anyhow!("json.parse: {}", e)))?;
            json_value_to_lua(lua, &value)
        })?,
    )?;

    json_table.set(
        "encode",
        lua.create_function(|_lua, value: LuaValue| {
            let json = lua_value_to_json(value)?;
            serde_json::to_string(&json)
                .map_err(|e| mlua::Error::external(anyhow!("json.encode: {}", e)))
        })?,
    )?;

    lua.globals().set("json", freeze_table(lua, json_table)?)?;
    Ok(())
}

fn register_print(lua: &Lua, app: &Arc<App>) -> LuaResult<()> {
    let logger = Arc::clone(&app.logger);
    lua.globals().set(
        "print",
        lua.create_function(move |_lua, args: mlua::Variadic<LuaValue>| {
            let parts: Vec<String> = args
                .iter()
                .map(|v| match v {
                    LuaValue::String(s) => s.to_string_lossy().to_string(),
                    other => format!("{:?}", other),
                })
                .collect();
            logger.debug(&format!("script: {}", parts.join("\t")));
            Ok(())
        })?,
    )?;
    Ok(())
}

/// Abort a bridge call when the script deadline has already passed.
fn check_deadline(deadline: Instant) -> LuaResult<()> {
    if Instant::now() > deadline {
        return Err(mlua::Error::RuntimeError(format!(
            "{} in host call",
            TIMEOUT_MESSAGE
        )));
    }
    Ok(())
}

fn to_lua<T: serde::Serialize>(lua: &Lua, value: &T) -> LuaResult<LuaValue> {
    let json = serde_json::to_value(value).map_err(mlua::Error::external)?;
    json_value_to_lua(lua, &json)
}

fn external(e: impl std::fmt::Display) -> mlua::Error {
    mlua::Error::RuntimeError(e.to_string())
}

fn opt_string_list(opts: &Option<LuaTable>, key: &str) -> Option<Vec<String>> {
    let table = opts.as_ref()?;
    match table.get::<LuaValue>(key).ok()? {
        LuaValue::String(s) => Some(vec![s.to_string_lossy().to_string()]),
        LuaValue::Table(t) => {
            let mut out = Vec::new();
            for i in 1..=t.raw_len() {
                if let Ok(s) = t.raw_get::<String>(i) {
                    out.push(s);
                }
            }
            Some(out)
        }
        _ => None,
    }
}

fn opt_usize(opts: &Option<LuaTable>, key: &str) -> Option<usize> {
    opts.as_ref()?.get::<i64>(key).ok().map(|v| v.max(0) as usize)
}

fn opt_bool(opts: &Option<LuaTable>, key: &str) -> Option<bool> {
    opts.as_ref()?.get::<bool>(key).ok()
}

fn opt_str(opts: &Option<LuaTable>, key: &str) -> Option<String> {
    opts.as_ref()?.get::<String>(key).ok()
}

/// Build and inject the frozen `opensrc` table.
fn register_opensrc_api(
    lua: &Lua,
    app: &Arc<App>,
    handle: &tokio::runtime::Handle,
    deadline: Instant,
) -> LuaResult<()> {
    let api = lua.create_table()?;

    // opensrc.list() → Source[]
    let a = Arc::clone(app);
    api.set(
        "list",
        lua.create_function(move |lua, ()| to_lua(lua, &a.registry.list()))?,
    )?;

    // opensrc.has(name, version?) → boolean
    let a = Arc::clone(app);
    api.set(
        "has",
        lua.create_function(move |_lua, (name, version): (String, Option<String>)| {
            Ok(a.registry.has(&name, version.as_deref()))
        })?,
    )?;

    // opensrc.get(name) → Source | nil
    let a = Arc::clone(app);
    api.set(
        "get",
        lua.create_function(move |lua, name: String| match a.registry.get(&name) {
            Some(source) => to_lua(lua, &source),
            None => Ok(LuaValue::Nil),
        })?,
    )?;

    // opensrc.files(source, glob?) → FileEntry[]
    let a = Arc::clone(app);
    api.set(
        "files",
        lua.create_function(move |lua, (source, glob): (String, Option<String>)| {
            check_deadline(deadline)?;
            let root = a
                .registry
                .resolve(&source)
                .ok_or_else(|| external(format!("Source not found: {}", source)))?;
            let entries = files::list_files(&root, glob.as_deref()).map_err(external)?;
            to_lua(lua, &entries)
        })?,
    )?;

    // opensrc.tree(source, {depth?, pattern?}) → TreeNode
    let a = Arc::clone(app);
    api.set(
        "tree",
        lua.create_function(move |lua, (source, opts): (String, Option<LuaTable>)| {
            check_deadline(deadline)?;
            let root = a
                .registry
                .resolve(&source)
                .ok_or_else(|| external(format!("Source not found: {}", source)))?;
            let depth = opt_usize(&opts, "depth").unwrap_or(3);
            let pattern = opt_str(&opts, "pattern");
            let node = files::tree(&root, depth, pattern.as_deref()).map_err(external)?;
            to_lua(lua, &node)
        })?,
    )?;

    // opensrc.read(source, path) → string
    let a = Arc::clone(app);
    api.set(
        "read",
        lua.create_function(move |_lua, (source, path): (String, String)| {
            check_deadline(deadline)?;
            let root = a
                .registry
                .resolve(&source)
                .ok_or_else(|| external(format!("Source not found: {}", source)))?;
            files::read_file(&root, &path).map_err(external)
        })?,
    )?;

    // opensrc.read_many(source, paths[]) → { path = content-or-error }
    let a = Arc::clone(app);
    api.set(
        "read_many",
        lua.create_function(move |lua, (source, paths): (String, Vec<String>)| {
            check_deadline(deadline)?;
            let root = a
                .registry
                .resolve(&source)
                .ok_or_else(|| external(format!("Source not found: {}", source)))?;
            let map = files::read_many(&root, &paths);
            let out = lua.create_table()?;
            for (k, v) in map {
                out.set(k, v)?;
            }
            Ok(out)
        })?,
    )?;

    // opensrc.grep(pattern, {sources?, include?, maxResults?, caseSensitive?})
    let a = Arc::clone(app);
    api.set(
        "grep",
        lua.create_function(move |lua, (pattern, opts): (String, Option<LuaTable>)| {
            check_deadline(deadline)?;
            let params = GrepParams {
                sources: opt_string_list(&opts, "sources"),
                include: opt_str(&opts, "include"),
                max_results: opt_usize(&opts, "maxResults"),
                case_sensitive: opt_bool(&opts, "caseSensitive").unwrap_or(false),
            };
            let matches =
                query::grep(&a.registry, &a.config, &pattern, &params).map_err(external)?;
            to_lua(lua, &matches)
        })?,
    )?;

    // opensrc.ast_grep(source, pattern, {glob?, lang?, limit?})
    let a = Arc::clone(app);
    api.set(
        "ast_grep",
        lua.create_function(
            move |lua, (source, pattern, opts): (String, String, Option<LuaTable>)| {
                check_deadline(deadline)?;
                let params = AstGrepParams {
                    glob: opt_str(&opts, "glob"),
                    langs: opt_string_list(&opts, "lang"),
                    limit: opt_usize(&opts, "limit"),
                };
                let matches = query::ast_grep(&a.registry, &a.config, &source, &pattern, &params)
                    .map_err(external)?;
                to_lua(lua, &matches)
            },
        )?,
    )?;

    // opensrc.semantic_search(q, {sources?, topK?})
    let a = Arc::clone(app);
    let h = handle.clone();
    api.set(
        "semantic_search",
        lua.create_function(move |lua, (q, opts): (String, Option<LuaTable>)| {
            check_deadline(deadline)?;
            let params = SemanticParams {
                sources: opt_string_list(&opts, "sources"),
                top_k: opt_usize(&opts, "topK"),
            };
            let outcome = h
                .block_on(query::semantic_search(
                    &a.store,
                    &a.engine,
                    &a.embedder,
                    &a.config,
                    &q,
                    &params,
                ))
                .map_err(external)?;
            to_lua(lua, &outcome)
        })?,
    )?;

    // opensrc.resolve(spec) → ParsedSpec
    api.set(
        "resolve",
        lua.create_function(move |lua, spec: String| {
            let parsed = crate::fetch::parse_spec(&spec).map_err(external)?;
            to_lua(lua, &parsed)
        })?,
    )?;

    // opensrc.fetch(specs, {modify?}) → FetchedSource[]
    let a = Arc::clone(app);
    let h = handle.clone();
    api.set(
        "fetch",
        lua.create_function(move |lua, (specs, opts): (LuaValue, Option<LuaTable>)| {
            check_deadline(deadline)?;
            let specs: Vec<String> = match specs {
                LuaValue::String(s) => vec![s.to_string_lossy().to_string()],
                LuaValue::Table(t) => {
                    let mut out = Vec::new();
                    for i in 1..=t.raw_len() {
                        out.push(t.raw_get::<String>(i)?);
                    }
                    out
                }
                _ => {
                    return Err(external("fetch expects a spec string or a list of specs"));
                }
            };
            let modify = opt_bool(&opts, "modify").unwrap_or(false);
            let results = h.block_on(a.fetch(&specs, modify));
            to_lua(lua, &results)
        })?,
    )?;

    // opensrc.remove(names[]) → {success, removed}
    let a = Arc::clone(app);
    let h = handle.clone();
    api.set(
        "remove",
        lua.create_function(move |lua, names: Vec<String>| {
            check_deadline(deadline)?;
            let removed = h.block_on(a.remove(&names)).map_err(external)?;
            let out = lua.create_table()?;
            out.set("success", true)?;
            out.set("removed", removed)?;
            Ok(out)
        })?,
    )?;

    // opensrc.clean({packages?, repos?, npm?, pypi?, crates?})
    let a = Arc::clone(app);
    let h = handle.clone();
    api.set(
        "clean",
        lua.create_function(move |lua, opts: Option<LuaTable>| {
            check_deadline(deadline)?;
            let filter = CleanFilter {
                packages: opt_bool(&opts, "packages").unwrap_or(false),
                repos: opt_bool(&opts, "repos").unwrap_or(false),
                npm: opt_bool(&opts, "npm").unwrap_or(false),
                pypi: opt_bool(&opts, "pypi").unwrap_or(false),
                crates: opt_bool(&opts, "crates").unwrap_or(false),
            };
            let removed = h.block_on(a.clean(filter)).map_err(external)?;
            let out = lua.create_table()?;
            out.set("success", true)?;
            out.set("removed", removed)?;
            Ok(out)
        })?,
    )?;

    // Spelling aliases for agents used to the camelCase surface.
    api.set("readMany", api.get::<LuaValue>("read_many")?)?;
    api.set("astGrep", api.get::<LuaValue>("ast_grep")?)?;
    api.set("semanticSearch", api.get::<LuaValue>("semantic_search")?)?;

    lua.globals().set("opensrc", freeze_table(lua, api)?)?;
    Ok(())
}

// ─── JSON ↔ Lua conversions ────────────────────────────────────────────

fn json_value_to_lua(lua: &Lua, value: &serde_json::Value) -> LuaResult<LuaValue> {
    match value {
        serde_json::Value::Null => Ok(LuaValue::Nil),
        serde_json::Value::Bool(b) => Ok(LuaValue::Boolean(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(LuaValue::Integer(i))
            } else {
                Ok(LuaValue::Number(n.as_f64().unwrap_or(0.0)))
            }
        }
        serde_json::Value::String(s) => lua.create_string(s).map(LuaValue::String),
        serde_json::Value::Array(arr) => {
            let table = lua.create_table()?;
            for (i, v) in arr.iter().enumerate() {
                table.set(i as i64 + 1, json_value_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(table))
        }
        serde_json::Value::Object(map) => {
            let table = lua.create_table()?;
            for (k, v) in map {
                table.set(k.as_str(), json_value_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(table))
        }
    }
}

fn lua_value_to_json(value: LuaValue) -> LuaResult<serde_json::Value> {
    match value {
        LuaValue::Nil => Ok(serde_json::Value::Null),
        LuaValue::Boolean(b) => Ok(serde_json::Value::Bool(b)),
        LuaValue::Integer(i) => Ok(serde_json::Value::Number(i.into())),
        LuaValue::Number(n) => Ok(serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)),
        LuaValue::String(s) => Ok(serde_json::Value::String(s.to_string_lossy().to_string())),
        LuaValue::Table(t) => {
            // Positive raw length means array; otherwise treat as object.
            let len = t.raw_len();
            if len > 0 {
                let mut arr = Vec::with_capacity(len);
                for i in 1..=len {
                    arr.push(lua_value_to_json(t.raw_get(i)?)?);
                }
                Ok(serde_json::Value::Array(arr))
            } else {
                let mut map = serde_json::Map::new();
                for pair in t.pairs::<String, LuaValue>() {
                    let (k, v) = pair?;
                    map.insert(k, lua_value_to_json(v)?);
                }
                Ok(serde_json::Value::Object(map))
            }
        }
        _ => Ok(serde_json::Value::Null),
    }
}
