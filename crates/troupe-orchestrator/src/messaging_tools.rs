//! Mailbox operations exposed to workers as tools
//!
//! The caller is never named in the input. It is resolved from the tool-call
//! session through [`Runtime::agent_id_for_session`], so a worker can only read
//! and settle its own inbox.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;
use troupe_agent::{parse_tool_input, Runtime, Tool, ToolContext};
use troupe_core::{Result, TroupeError};

use crate::mailbox::{Mailbox, SendRequest, MAX_DELAY_MS};

pub const SEND_MESSAGE: &str = "agent_send_message";
pub const RECEIVE_MESSAGES: &str = "agent_receive_messages";
pub const ACK_MESSAGES: &str = "agent_ack_messages";
pub const NACK_MESSAGE: &str = "agent_nack_message";
pub const LIST_DEAD_LETTERS: &str = "agent_list_dead_letters";

/// Every messaging tool name, in registration order
pub const MESSAGING_TOOL_NAMES: [&str; 5] = [
    SEND_MESSAGE,
    RECEIVE_MESSAGES,
    ACK_MESSAGES,
    NACK_MESSAGE,
    LIST_DEAD_LETTERS,
];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SendMessageInput {
    to_agent_id: String,
    payload: Value,
    topic: Option<String>,
    correlation_id: Option<String>,
    idempotency_key: Option<String>,
    run_id: Option<String>,
    max_attempts: Option<u32>,
    delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ReceiveMessagesInput {
    limit: Option<usize>,
    lease_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct AckMessagesInput {
    message_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct NackMessageInput {
    message_id: String,
    error: Option<String>,
    requeue_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ListDeadLettersInput {
    limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Send,
    Receive,
    Ack,
    Nack,
    ListDeadLetters,
}

impl Operation {
    const ALL: [Operation; 5] = [
        Self::Send,
        Self::Receive,
        Self::Ack,
        Self::Nack,
        Self::ListDeadLetters,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::Send => SEND_MESSAGE,
            Self::Receive => RECEIVE_MESSAGES,
            Self::Ack => ACK_MESSAGES,
            Self::Nack => NACK_MESSAGE,
            Self::ListDeadLetters => LIST_DEAD_LETTERS,
        }
    }

    fn description(self) -> &'static str {
        match self {
            Self::Send => "Send a JSON payload to another agent's mailbox",
            Self::Receive => "Lease visible messages from your mailbox; ack them before the lease expires",
            Self::Ack => "Acknowledge messages you received so they are not redelivered",
            Self::Nack => "Reject a received message; it is retried later or dead-lettered",
            Self::ListDeadLetters => "List messages in your mailbox that ran out of attempts",
        }
    }

    fn input_schema(self) -> Value {
        match self {
            Self::Send => json!({
                "type": "object",
                "properties": {
                    "toAgentId": {"type": "string"},
                    "payload": {},
                    "topic": {"type": "string"},
                    "correlationId": {"type": "string"},
                    "idempotencyKey": {"type": "string"},
                    "runId": {"type": "string"},
                    "maxAttempts": {"type": "integer", "minimum": 1},
                    "delayMs": {"type": "integer", "minimum": 0, "maximum": MAX_DELAY_MS}
                },
                "required": ["toAgentId", "payload"],
                "additionalProperties": false
            }),
            Self::Receive => json!({
                "type": "object",
                "properties": {
                    "limit": {"type": "integer", "minimum": 1},
                    "leaseMs": {"type": "integer", "minimum": 1, "maximum": MAX_DELAY_MS}
                },
                "additionalProperties": false
            }),
            Self::Ack => json!({
                "type": "object",
                "properties": {
                    "messageIds": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["messageIds"],
                "additionalProperties": false
            }),
            Self::Nack => json!({
                "type": "object",
                "properties": {
                    "messageId": {"type": "string"},
                    "error": {"type": "string"},
                    "requeueDelayMs": {"type": "integer", "minimum": 0, "maximum": MAX_DELAY_MS}
                },
                "required": ["messageId"],
                "additionalProperties": false
            }),
            Self::ListDeadLetters => json!({
                "type": "object",
                "properties": {
                    "limit": {"type": "integer", "minimum": 1}
                },
                "additionalProperties": false
            }),
        }
    }
}

/// One mailbox operation bound to a mailbox and the runtime that owns sessions
pub struct MessagingTool {
    operation: Operation,
    mailbox: Arc<Mailbox>,
    runtime: Arc<dyn Runtime>,
}

impl MessagingTool {
    async fn caller(&self, ctx: &ToolContext) -> Result<String> {
        self.runtime
            .agent_id_for_session(&ctx.session_id)
            .await?
            .ok_or_else(|| {
                TroupeError::UnknownAgent(format!("no agent bound to session {}", ctx.session_id))
            })
    }

    fn invalid(&self, reason: impl Into<String>) -> TroupeError {
        TroupeError::ToolInput {
            tool: self.operation.name().to_string(),
            reason: reason.into(),
        }
    }

    async fn send(&self, caller: String, ctx: &ToolContext, input: Value) -> Result<Value> {
        let input: SendMessageInput = parse_tool_input(SEND_MESSAGE, input)?;
        if input.to_agent_id.trim().is_empty() {
            return Err(self.invalid("toAgentId must not be empty"));
        }
        if input.max_attempts == Some(0) {
            return Err(self.invalid("maxAttempts must be at least 1"));
        }

        let mut request = SendRequest::new(caller, input.to_agent_id.trim(), input.payload);
        request.topic = input.topic;
        request.correlation_id = input.correlation_id;
        request.idempotency_key = input.idempotency_key;
        request.max_attempts = input.max_attempts;
        request.delay_ms = input.delay_ms;
        request.run_id = input.run_id.or_else(|| ctx.run_id.clone());

        let message = self.mailbox.send(request).await?;
        Ok(json!({ "message": message }))
    }

    async fn receive(&self, caller: String, input: Value) -> Result<Value> {
        let input: ReceiveMessagesInput = parse_tool_input(RECEIVE_MESSAGES, input)?;
        if input.limit == Some(0) {
            return Err(self.invalid("limit must be at least 1"));
        }
        if input.lease_ms == Some(0) {
            return Err(self.invalid("leaseMs must be at least 1"));
        }
        let messages = self
            .mailbox
            .receive(&caller, input.limit, input.lease_ms)
            .await;
        Ok(json!({ "messages": messages }))
    }

    async fn ack(&self, caller: String, input: Value) -> Result<Value> {
        let input: AckMessagesInput = parse_tool_input(ACK_MESSAGES, input)?;
        let mut acked = Vec::new();
        let mut missing = Vec::new();
        for id in input.message_ids {
            if self.mailbox.ack(&caller, &id).await {
                acked.push(id);
            } else {
                missing.push(id);
            }
        }
        Ok(json!({ "acked": acked, "missing": missing }))
    }

    async fn nack(&self, caller: String, input: Value) -> Result<Value> {
        let input: NackMessageInput = parse_tool_input(NACK_MESSAGE, input)?;
        let outcome = self
            .mailbox
            .nack(
                &caller,
                &input.message_id,
                input.error,
                input.requeue_delay_ms,
            )
            .await;
        Ok(serde_json::to_value(outcome)?)
    }

    async fn list_dead_letters(&self, caller: String, input: Value) -> Result<Value> {
        let input: ListDeadLettersInput = parse_tool_input(LIST_DEAD_LETTERS, input)?;
        let messages = self.mailbox.list_dead_letters(&caller, input.limit).await;
        Ok(json!({ "messages": messages }))
    }
}

#[async_trait]
impl Tool for MessagingTool {
    fn name(&self) -> &str {
        self.operation.name()
    }

    fn description(&self) -> &str {
        self.operation.description()
    }

    fn input_schema(&self) -> Value {
        self.operation.input_schema()
    }

    async fn call(&self, ctx: &ToolContext, input: Value) -> Result<Value> {
        let caller = self.caller(ctx).await?;
        debug!("{} called by {}", self.operation.name(), caller);

        match self.operation {
            Operation::Send => self.send(caller, ctx, input).await,
            Operation::Receive => self.receive(caller, input).await,
            Operation::Ack => self.ack(caller, input).await,
            Operation::Nack => self.nack(caller, input).await,
            Operation::ListDeadLetters => self.list_dead_letters(caller, input).await,
        }
    }
}

/// The five messaging tools, bound to one mailbox
pub fn messaging_tools(mailbox: Arc<Mailbox>, runtime: Arc<dyn Runtime>) -> Vec<Arc<dyn Tool>> {
    Operation::ALL
        .iter()
        .map(|&operation| {
            Arc::new(MessagingTool {
                operation,
                mailbox: mailbox.clone(),
                runtime: runtime.clone(),
            }) as Arc<dyn Tool>
        })
        .collect()
}
