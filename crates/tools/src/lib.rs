//! The fixed tool set the turn orchestrator dispatches into.
//!
//! Dispatch is a table from tool name to handler ("a table from tool name
//! to (argDecoder, runFn) ... so new tools compose
//! cleanly"), not a long `match`. Every handler fails *locally*: a validation
//! or execution error becomes `{"error": "..."}` with `success = false`
//! rather than propagating, so the turn orchestrator can feed the failure
//! back to the model instead of aborting the turn.

mod context;
mod fs_tools;
mod memory_tools;
mod shell_tools;

pub use context::ToolContext;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{json, Value};

/// A single declared parameter, shaped as a minimal JSON-Schema property so
/// it can be advertised to the LLM verbatim — "a real (mini) JSON Schema
/// object rather than just a description string".
#[derive(Debug, Clone)]
pub struct ToolParam {
    pub name: &'static str,
    pub description: &'static str,
    pub required: bool,
    pub schema_type: &'static str,
}

#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub params: Vec<ToolParam>,
}

impl ToolSpec {
    /// Renders this spec as an OpenAI-style function-tool declaration.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for param in &self.params {
            properties.insert(
                param.name.to_string(),
                json!({ "type": param.schema_type, "description": param.description }),
            );
            if param.required {
                required.push(param.name);
            }
        }
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": {
                    "type": "object",
                    "properties": properties,
                    "required": required,
                }
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub success: bool,
    pub output: Value,
}

type ToolFuture = Pin<Box<dyn Future<Output = ToolOutput> + Send>>;
type ToolHandler = Box<dyn Fn(Value) -> ToolFuture + Send + Sync>;

/// The dispatch table plus the parallel list of advertised specs.
pub struct ToolRegistry {
    specs: Vec<ToolSpec>,
    handlers: HashMap<&'static str, ToolHandler>,
}

impl ToolRegistry {
    fn new() -> Self {
        Self {
            specs: Vec::new(),
            handlers: HashMap::new(),
        }
    }

    fn register<F, Fut>(&mut self, spec: ToolSpec, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let name = spec.name;
        self.specs.push(spec);
        self.handlers.insert(
            name,
            Box::new(move |args| {
                let fut = handler(args);
                Box::pin(async move {
                    match fut.await {
                        Ok(output) => ToolOutput { success: true, output },
                        Err(e) => ToolOutput {
                            success: false,
                            output: json!({ "error": e.to_string() }),
                        },
                    }
                })
            }),
        );
    }

    pub fn list_specs(&self) -> &[ToolSpec] {
        &self.specs
    }

    pub fn tools_json(&self) -> Value {
        Value::Array(self.specs.iter().map(ToolSpec::to_json_schema).collect())
    }

    /// Dispatches by name; an unknown tool name is itself a local failure
    /// rather than a panic, matching every other validation failure's shape.
    pub async fn dispatch(&self, name: &str, args: Value) -> ToolOutput {
        match self.handlers.get(name) {
            Some(handler) => handler(args).await,
            None => ToolOutput {
                success: false,
                output: json!({ "error": format!("unknown tool: {name}") }),
            },
        }
    }
}

fn param(name: &'static str, description: &'static str, required: bool, schema_type: &'static str) -> ToolParam {
    ToolParam { name, description, required, schema_type }
}

/// Builds the full registry for one running instance, closing over `ctx`
/// — a capability object in place of a global singleton.
pub fn build_registry(ctx: Arc<ToolContext>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    {
        let ctx = ctx.clone();
        registry.register(
            ToolSpec {
                name: "run_command",
                description: "Run a shell command, optionally inside a persistent session created by create_shell_session.",
                params: vec![
                    param("sessionId", "Session id from create_shell_session; omitted for a one-shot command", false, "string"),
                    param("command", "The shell command to run", true, "string"),
                    param("cwd", "Working directory for a one-shot command", false, "string"),
                    param("timeoutMs", "Timeout in milliseconds (max 300000)", false, "integer"),
                    param("interactive", "Run as an interactive command you can feed via write_stdin", false, "boolean"),
                ],
            },
            move |args| shell_tools::run_command(ctx.clone(), args),
        );
    }
    {
        let ctx = ctx.clone();
        registry.register(
            ToolSpec {
                name: "create_shell_session",
                description: "Create a persistent shell session that keeps its working directory and environment across commands.",
                params: vec![param("cwd", "Initial working directory", false, "string")],
            },
            move |args| shell_tools::create_shell_session(ctx.clone(), args),
        );
    }
    {
        let ctx = ctx.clone();
        registry.register(
            ToolSpec {
                name: "close_shell_session",
                description: "Kill and remove a shell session by id.",
                params: vec![param("sessionId", "Session id to close", true, "string")],
            },
            move |args| shell_tools::close_shell_session(ctx.clone(), args),
        );
    }
    {
        let ctx = ctx.clone();
        registry.register(
            ToolSpec {
                name: "write_stdin",
                description: "Write characters to an in-flight interactive or timed-out command and read back any new output.",
                params: vec![
                    param("sessionId", "Session id", true, "string"),
                    param("chars", "Characters to write to stdin", false, "string"),
                    param("yieldMs", "How long to wait before reading back output (max 300000)", false, "integer"),
                ],
            },
            move |args| shell_tools::write_stdin(ctx.clone(), args),
        );
    }

    registry.register(
        ToolSpec {
            name: "read_file",
            description: "Read a file's contents as UTF-8 (lossy), up to a byte cap.",
            params: vec![
                param("path", "Path to the file", true, "string"),
                param("maxBytes", "Maximum bytes to read (default 200000, hard cap 2000000)", false, "integer"),
            ],
        },
        fs_tools::read_file,
    );
    registry.register(
        ToolSpec {
            name: "write_file",
            description: "Write UTF-8 content to a file, creating parent directories as needed.",
            params: vec![
                param("path", "Path to the file", true, "string"),
                param("content", "Content to write", true, "string"),
                param("createIfMissing", "Create the file if it doesn't exist (default true)", false, "boolean"),
            ],
        },
        fs_tools::write_file,
    );
    registry.register(
        ToolSpec {
            name: "edit_file",
            description: "Apply one or more line-range patches to an existing file.",
            params: vec![
                param("path", "Path to the file", true, "string"),
                param("patches", "Array of {startLine, endLine, newText} (1-based, end-exclusive)", true, "array"),
            ],
        },
        fs_tools::edit_file,
    );
    registry.register(
        ToolSpec {
            name: "list_files",
            description: "Breadth-first listing of a directory's entries.",
            params: vec![
                param("path", "Directory to list", true, "string"),
                param("recursive", "Descend into subdirectories (default false)", false, "boolean"),
                param("maxEntries", "Maximum entries to return (default 500, hard cap 5000)", false, "integer"),
            ],
        },
        fs_tools::list_files,
    );

    {
        let memory_path = ctx.memory_path.clone();
        registry.register(
            ToolSpec {
                name: "update_system_prompt_memory",
                description: "Append a fact to persistent memory shown in every future system prompt.",
                params: vec![param("memory", "The fact to remember", true, "string")],
            },
            move |args| {
                let memory_path = memory_path.clone();
                async move { memory_tools::update_system_prompt_memory(&memory_path, args).await }
            },
        );
    }
    {
        let memory_path = ctx.memory_path.clone();
        registry.register(
            ToolSpec {
                name: "list_system_prompt_memory",
                description: "List all currently remembered facts.",
                params: vec![],
            },
            move |args| {
                let memory_path = memory_path.clone();
                async move { memory_tools::list_system_prompt_memory(&memory_path, args).await }
            },
        );
    }
    {
        let memory_path = ctx.memory_path.clone();
        registry.register(
            ToolSpec {
                name: "clear_system_prompt_memory",
                description: "Forget all remembered facts.",
                params: vec![],
            },
            move |args| {
                let memory_path = memory_path.clone();
                async move { memory_tools::clear_system_prompt_memory(&memory_path, args).await }
            },
        );
    }

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use shrimp_shell::ShellPool;
    use std::path::PathBuf;

    fn test_ctx(dir: &std::path::Path) -> Arc<ToolContext> {
        let shell = ShellPool::new(shrimp_config::ShellConfig::default());
        ToolContext::new(shell, dir.to_path_buf(), dir.join("system-prompt-memory.json"))
    }

    #[test]
    fn registry_lists_all_eleven_tools() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let registry = build_registry(ctx);
        let names: Vec<_> = registry.list_specs().iter().map(|s| s.name).collect();
        for expected in [
            "run_command",
            "create_shell_session",
            "close_shell_session",
            "write_stdin",
            "read_file",
            "write_file",
            "edit_file",
            "list_files",
            "update_system_prompt_memory",
            "list_system_prompt_memory",
            "clear_system_prompt_memory",
        ] {
            assert!(names.contains(&expected), "missing tool: {expected}");
        }
    }

    #[tokio::test]
    async fn dispatch_unknown_tool_fails_locally() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let registry = build_registry(ctx);
        let result = registry.dispatch("does_not_exist", json!({})).await;
        assert!(!result.success);
        assert!(result.output["error"].as_str().unwrap().contains("unknown tool"));
    }

    #[tokio::test]
    async fn read_write_roundtrip_through_registry() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let registry = build_registry(ctx);
        let path: PathBuf = dir.path().join("hello.txt");

        let write = registry
            .dispatch("write_file", json!({"path": path.to_str().unwrap(), "content": "hi"}))
            .await;
        assert!(write.success);

        let read = registry
            .dispatch("read_file", json!({"path": path.to_str().unwrap()}))
            .await;
        assert!(read.success);
        assert_eq!(read.output["content"], "hi");
    }
}
