//! The trigger-run executor: runs one non-interactive turn on behalf of a
//! scheduled/API/webhook trigger and extracts its `<final_result>`
//! convention.

use regex::Regex;
use serde_json::json;
use tracing::{info, warn};

use shrimp_store::{Store, TriggerKind, TriggerRun};

use crate::error::Result;
use crate::turn::{Runtime, TurnRequest};

const RESULT_PREVIEW_CHARS: usize = 500;

/// `{run, conversationId, finalResult, resultPreview}`.
#[derive(Debug, Clone)]
pub struct TriggerRunOutcome {
    pub run: TriggerRun,
    pub conversation_id: String,
    pub final_result: Option<String>,
    pub result_preview: String,
}

/// Fixed reminder appended to every synthesized run message: "a fixed block
/// reminding the model of tool autonomy and the
/// `<final_result>…</final_result>` convention".
const AUTONOMY_REMINDER: &str = "\
You are running unattended as a scheduled/triggered task: there is no human \
to ask follow-up questions, so use your tools autonomously to complete the \
instruction above. When you have a concrete outcome to report, wrap it in \
<final_result>...</final_result> tags in your final reply.";

fn synthesize_run_message(instruction: &str, payload: Option<&serde_json::Value>) -> String {
    let mut message = instruction.to_string();
    if let Some(payload) = payload {
        let pretty = serde_json::to_string_pretty(payload).unwrap_or_else(|_| payload.to_string());
        message.push_str("\n\n");
        message.push_str(&pretty);
    }
    message.push_str("\n\n");
    message.push_str(AUTONOMY_REMINDER);
    message
}

/// Case-insensitive first-match extraction of `<final_result>…</final_result>`,
/// whitespace-collapsed and trimmed.
fn extract_final_result(full_text: &str) -> Option<String> {
    let re = Regex::new(r"(?is)<final_result>(.*?)</final_result>").expect("valid final_result regex");
    re.captures(full_text).map(|caps| {
        caps[1].split_whitespace().collect::<Vec<_>>().join(" ")
    })
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_chars {
        text.to_string()
    } else {
        chars[..max_chars].iter().collect()
    }
}

impl Runtime {
    pub async fn run_trigger(
        &self,
        trigger_kind: TriggerKind,
        instruction: &str,
        model: Option<&str>,
        payload: Option<serde_json::Value>,
    ) -> Result<TriggerRunOutcome> {
        // Step 1: persist a running TriggerRun.
        let run = self
            .store
            .create_trigger_run(trigger_kind, instruction, model, payload.clone())
            .await?;

        // Step 2: synthesize the run message.
        let synthesized = synthesize_run_message(instruction, payload.as_ref());

        // Step 3: invoke the turn orchestrator non-streaming. A thrown error
        // marks the run failed and re-raises.
        let turn_result = match self
            .run_turn_silent(TurnRequest { message: synthesized, model: model.map(str::to_string), ..Default::default() })
            .await
        {
            Ok(result) => result,
            Err(err) => {
                warn!(trigger_run_id = %run.id, error = %err, "trigger run failed");
                self.store
                    .complete_trigger_run(&run.id, false, json!({ "error": err.to_string() }), None)
                    .await?;
                return Err(err);
            }
        };

        // Step 4: concatenate bubbles and extract the final result.
        let full_text = turn_result.bubbles.join("\n\n");
        let final_result = extract_final_result(&full_text);

        // Step 5: record the conversation id, then complete the run.
        self.store
            .set_trigger_run_conversation_id(&run.id, &turn_result.conversation_id)
            .await?;
        let output = json!({
            "bubbles": turn_result.bubbles,
            "conversationId": turn_result.conversation_id,
            "finalResult": final_result,
        });
        let completed = self
            .store
            .complete_trigger_run(&run.id, true, output, final_result.as_deref())
            .await?
            .unwrap_or(run);

        info!(trigger_run_id = %completed.id, "trigger run completed");

        // Step 6: return the reloaded run plus the convenience fields.
        Ok(TriggerRunOutcome {
            run: completed,
            conversation_id: turn_result.conversation_id,
            result_preview: truncate_chars(&full_text, RESULT_PREVIEW_CHARS),
            final_result,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesized_message_includes_instruction_payload_and_reminder() {
        let message = synthesize_run_message("check disk usage", Some(&json!({"threshold": 90})));
        assert!(message.starts_with("check disk usage"));
        assert!(message.contains("\"threshold\": 90"));
        assert!(message.contains("<final_result>"));
    }

    #[test]
    fn extracts_first_final_result_case_insensitively() {
        let text = "intro text\n\n<FINAL_RESULT>  the   answer is 42  </FINAL_RESULT>\n\nmore";
        assert_eq!(extract_final_result(text), Some("the answer is 42".to_string()));
    }

    #[test]
    fn missing_final_result_tag_yields_none() {
        assert_eq!(extract_final_result("just a plain reply"), None);
    }
}
