use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::warn;

use crate::canvas::{AnswerType, MAX_QUESTION_OPTIONS, NodeKind, OptionType, PORT_DEFAULT, QuestionConfig};
use crate::engine::interrupt::InterruptType;
use crate::engine::template::render;
use crate::nodes::{CapabilityProvider, InterruptRequest, NodeInput, NodeOutcome, NodeOutput};

const OTHER_OPTION: &str = "other";

/// Asks the user a question, optionally with choices, and routes on the answer.
pub struct QuestionProvider;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Exchange {
    question: String,
    answer: String,
}

/// Provider state carried across rounds in the checkpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QaState {
    #[serde(default)]
    history: Vec<Exchange>,
}

/// `A` for the first option. Callers keep `index` below `MAX_QUESTION_OPTIONS`.
fn option_id(index: usize) -> String {
    char::from(b'A' + index as u8).to_string()
}

fn options(config: &QuestionConfig, inputs: &Map<String, Value>) -> Vec<String> {
    let mut choices: Vec<String> = match config.option_type {
        OptionType::Static => config.options.clone(),
        OptionType::Dynamic => inputs
            .get("options")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default(),
    };
    if choices.len() > MAX_QUESTION_OPTIONS {
        warn!(count = choices.len(), "Question options beyond Z dropped");
        choices.truncate(MAX_QUESTION_OPTIONS);
    }
    choices
}

fn answer_text(data: &Value) -> String {
    match data {
        Value::String(s) => s.clone(),
        Value::Object(map) => match map.get("answer") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        },
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Match an answer by option ID (`A`, `b`, ...) or by exact content.
fn match_option(answer: &str, options: &[String]) -> Option<usize> {
    let trimmed = answer.trim();
    options
        .iter()
        .enumerate()
        .position(|(i, content)| {
            trimmed.eq_ignore_ascii_case(&option_id(i)) || trimmed == content.trim()
        })
}

fn ask(question: &str, config: &QuestionConfig, choices: &[String], state: QaState) -> Result<NodeOutcome> {
    let mut payload = json!({
        "question": question,
        "answer_type": config.answer_type,
        "history": state.history,
    });
    if config.answer_type == AnswerType::Option {
        payload["options"] = choices
            .iter()
            .enumerate()
            .map(|(i, c)| json!({"id": option_id(i), "content": c}))
            .collect();
    }
    Ok(NodeOutcome::Interrupt(InterruptRequest {
        event_type: InterruptType::Question,
        payload,
        state: Some(serde_json::to_value(state)?),
    }))
}

#[async_trait]
impl CapabilityProvider for QuestionProvider {
    fn node_type(&self) -> NodeKind {
        NodeKind::QuestionAnswer
    }

    fn description(&self) -> &str {
        "Ask the user a question and branch on the chosen option"
    }

    async fn execute(&self, input: NodeInput) -> Result<NodeOutcome> {
        let config: QuestionConfig = if input.config.is_null() {
            QuestionConfig::default()
        } else {
            serde_json::from_value(input.config.clone()).context("invalid question config")?
        };
        let question = render(&config.question, &input.inputs);
        let choices = options(&config, &input.inputs);

        let Some(resume) = &input.resume else {
            return ask(&question, &config, &choices, QaState::default());
        };
        let mut state: QaState = match &resume.state {
            Some(s) => serde_json::from_value(s.clone()).unwrap_or_default(),
            None => QaState::default(),
        };
        let answer = answer_text(&resume.data);
        state.history.push(Exchange {
            question: question.clone(),
            answer: answer.clone(),
        });

        if answer.trim().is_empty() {
            return ask(&question, &config, &choices, state);
        }

        let history = serde_json::to_value(&state.history)?;
        let mut output = Map::new();
        let port = match config.answer_type {
            AnswerType::Text => {
                output.insert("USER_RESPONSE".to_string(), Value::String(answer));
                None
            }
            AnswerType::Option => match match_option(&answer, &choices) {
                Some(i) => {
                    output.insert("optionId".to_string(), Value::String(option_id(i)));
                    output.insert("optionContent".to_string(), Value::String(choices[i].clone()));
                    let branch = match config.option_type {
                        OptionType::Static => i,
                        OptionType::Dynamic => 0,
                    };
                    Some(format!("branch_{}", branch))
                }
                None => {
                    output.insert("optionId".to_string(), Value::String(OTHER_OPTION.to_string()));
                    output.insert("optionContent".to_string(), Value::String(answer));
                    Some(PORT_DEFAULT.to_string())
                }
            },
        };
        output.insert("history".to_string(), history);

        Ok(NodeOutcome::Output(NodeOutput {
            output,
            port,
            ..Default::default()
        }))
    }
}
