use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use shrimp_shell::CommandOutput;

use crate::context::ToolContext;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const MAX_TIMEOUT_MS: u64 = 5 * 60 * 1000;

fn command_output_to_json(out: CommandOutput) -> Value {
    json!({
        "exitCode": out.exit_code,
        "stdout": out.stdout,
        "stderr": out.stderr,
        "timedOut": out.timed_out,
        "busy": out.busy,
        "cwd": out.cwd,
    })
}

fn validated_timeout(args: &Value) -> Result<u64> {
    match args.get("timeoutMs") {
        None | Some(Value::Null) => Ok(DEFAULT_TIMEOUT_MS),
        Some(v) => {
            let ms = v
                .as_u64()
                .ok_or_else(|| anyhow!("timeoutMs must be a positive integer"))?;
            if ms > MAX_TIMEOUT_MS {
                return Err(anyhow!("timeoutMs must not exceed {MAX_TIMEOUT_MS}"));
            }
            Ok(ms)
        }
    }
}

pub async fn run_command(ctx: Arc<ToolContext>, args: Value) -> Result<Value> {
    let command = args
        .get("command")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing required param: command"))?;
    let timeout_ms = validated_timeout(&args)?;
    let interactive = args
        .get("interactive")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let session_id = args.get("sessionId").and_then(Value::as_str);

    let out = match session_id {
        Some(id) => ctx.shell.run_command(id, command, interactive, timeout_ms).await?,
        None => {
            let cwd = args
                .get("cwd")
                .and_then(Value::as_str)
                .map(|s| s.to_string())
                .unwrap_or_else(|| ctx.workspace_root.to_string_lossy().into_owned());
            ctx.shell.run_ephemeral(&cwd, command, timeout_ms).await
        }
    };

    Ok(command_output_to_json(out))
}

pub async fn create_shell_session(ctx: Arc<ToolContext>, args: Value) -> Result<Value> {
    let cwd = args.get("cwd").and_then(Value::as_str);
    let info = ctx.shell.create_session(cwd).await?;
    Ok(json!({
        "sessionId": info.session_id,
        "shell": info.shell,
        "os": info.os,
        "cwd": info.cwd,
    }))
}

pub async fn close_shell_session(ctx: Arc<ToolContext>, args: Value) -> Result<Value> {
    let session_id = args
        .get("sessionId")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing required param: sessionId"))?;
    let closed = ctx.shell.close_session(session_id).await;
    Ok(json!({ "closed": closed }))
}

pub async fn write_stdin(ctx: Arc<ToolContext>, args: Value) -> Result<Value> {
    let session_id = args
        .get("sessionId")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing required param: sessionId"))?;
    let chars = args.get("chars").and_then(Value::as_str).unwrap_or("");
    let yield_ms = args
        .get("yieldMs")
        .and_then(Value::as_u64)
        .unwrap_or(100)
        .min(MAX_TIMEOUT_MS);

    let out = ctx.shell.write_stdin(session_id, chars, yield_ms).await?;
    Ok(json!({
        "stdout": out.stdout,
        "stderr": out.stderr,
        "completed": out.completed.map(|c| json!({
            "exitCode": c.exit_code,
            "cwd": c.cwd,
        })),
    }))
}
