//! Line-mode interactive session: one process invocation, one conversation,
//! reusing the same `conversationId` across turns until the user exits.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use serde_json::Value;

use shrimp_runtime::{CancellationToken, EventSink, Runtime, TurnRequest};

struct ConsoleSink;

impl EventSink for ConsoleSink {
    fn on_tool_call_started(&self, _tool_call_id: &str, tool_name: &str, args: &Value) {
        println!("\n[tool] {tool_name} {args}");
    }

    fn on_tool_call_finished(&self, _tool_call_id: &str, ok: bool, output: &Value) {
        let status = if ok { "ok" } else { "error" };
        println!("[tool:{status}] {}", truncate(&output.to_string(), 400));
    }

    fn on_assistant_token(&self, _bubble_id: &str, value: &str) {
        print!("{value}");
        let _ = io::stdout().flush();
    }

    fn on_assistant_done(&self) {
        println!();
    }

    fn on_error(&self, message: &str) {
        eprintln!("\nerror: {message}");
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_chars {
        text.to_string()
    } else {
        format!("{}...", chars[..max_chars].iter().collect::<String>())
    }
}

pub async fn run_interactive_session(
    runtime: Arc<Runtime>,
    mut conversation_id: Option<String>,
    model: Option<String>,
) -> anyhow::Result<()> {
    println!("shrimp — local computer-use assistant. Type /exit to quit.");
    let sink = ConsoleSink;
    let stdin = io::stdin();

    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            println!();
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/exit" || line == "/quit" {
            break;
        }

        let cancel = CancellationToken::new();
        let request = TurnRequest {
            conversation_id: conversation_id.clone(),
            message: line.to_string(),
            model: model.clone(),
            ..Default::default()
        };

        match runtime.run_turn(request, &sink, &cancel).await {
            Ok(result) => conversation_id = Some(result.conversation_id),
            Err(err) => eprintln!("error: {err}"),
        }
    }

    Ok(())
}
