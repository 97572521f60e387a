//! Wire types.
//!
//! Client frame: `{"requestId": 1, "method": "write", "params": {...}}`.
//! Server frames are tagged by `type`: `response` carries `result` or
//! `error`, `event` carries a session id and a [`TerminalEvent`].

use anyhow::{anyhow, bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use settings::constants::rpc::MAX_SESSION_ID_LENGTH;
use terminal::{CreateOptions, KillOptions, TerminalEvent};

/// Raw client frame before the method is interpreted.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFrame {
    #[serde(default)]
    pub request_id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrAttachParams {
    pub id: String,
    #[serde(flatten)]
    pub options: CreateOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WriteParams {
    pub id: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResizeParams {
    pub id: String,
    pub cols: u16,
    pub rows: u16,
    #[serde(default)]
    pub seq: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SignalParams {
    pub id: String,
    #[serde(default)]
    pub signal: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionParams {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillParams {
    pub id: String,
    #[serde(flatten)]
    pub options: KillOptions,
}

/// A validated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    CreateOrAttach(CreateOrAttachParams),
    Write(WriteParams),
    Resize(ResizeParams),
    Signal(SignalParams),
    Detach(SessionParams),
    Kill(KillParams),
    GetSession(SessionParams),
    GetHistory(SessionParams),
    GetPersistedHistory(SessionParams),
    ListSessions,
    Subscribe(SessionParams),
}

impl Request {
    /// Interpret `method`/`params` and validate the inputs.
    pub fn from_frame(frame: RequestFrame) -> Result<Self> {
        let RequestFrame { method, params, .. } = frame;
        let request = match method.as_str() {
            "createOrAttach" => Request::CreateOrAttach(params_of(&method, params)?),
            "write" => Request::Write(params_of(&method, params)?),
            "resize" => Request::Resize(params_of(&method, params)?),
            "signal" => Request::Signal(params_of(&method, params)?),
            "detach" => Request::Detach(params_of(&method, params)?),
            "kill" => Request::Kill(params_of(&method, params)?),
            "getSession" => Request::GetSession(params_of(&method, params)?),
            "getHistory" => Request::GetHistory(params_of(&method, params)?),
            "getPersistedHistory" => Request::GetPersistedHistory(params_of(&method, params)?),
            "listSessions" => Request::ListSessions,
            "subscribe" => Request::Subscribe(params_of(&method, params)?),
            other => bail!("unknown method: {}", other),
        };
        request.validate()?;
        Ok(request)
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Request::CreateOrAttach(CreateOrAttachParams { id, .. })
            | Request::Write(WriteParams { id, .. })
            | Request::Resize(ResizeParams { id, .. })
            | Request::Signal(SignalParams { id, .. })
            | Request::Kill(KillParams { id, .. })
            | Request::Detach(SessionParams { id })
            | Request::GetSession(SessionParams { id })
            | Request::GetHistory(SessionParams { id })
            | Request::GetPersistedHistory(SessionParams { id })
            | Request::Subscribe(SessionParams { id }) => Some(id.as_str()),
            Request::ListSessions => None,
        }
    }

    fn validate(&self) -> Result<()> {
        if let Some(id) = self.session_id() {
            validate_session_id(id)?;
        }
        match self {
            Request::Resize(ResizeParams { cols, rows, .. }) if *cols == 0 || *rows == 0 => {
                bail!("invalid size {}x{}", cols, rows)
            }
            Request::CreateOrAttach(CreateOrAttachParams { options, .. })
                if options.cols == Some(0) || options.rows == Some(0) =>
            {
                bail!("cols and rows must be non-zero")
            }
            _ => Ok(()),
        }
    }
}

fn params_of<T: DeserializeOwned>(method: &str, params: Value) -> Result<T> {
    if params.is_null() {
        return Err(anyhow!("missing params for {}", method));
    }
    serde_json::from_value(params).with_context(|| format!("invalid params for {}", method))
}

pub fn validate_session_id(id: &str) -> Result<()> {
    if id.is_empty() {
        bail!("session id must not be empty");
    }
    if id.len() > MAX_SESSION_ID_LENGTH {
        bail!(
            "session id is {} bytes, the limit is {}",
            id.len(),
            MAX_SESSION_ID_LENGTH
        );
    }
    Ok(())
}

/// Frame sent from the server to a client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Response(Response),
    Event(EventFrame),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub request_id: Value,
    #[serde(flatten)]
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    Result(Value),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFrame {
    pub session_id: String,
    pub event: TerminalEvent,
}

impl ServerMessage {
    pub fn result(request_id: Value, result: Value) -> Self {
        ServerMessage::Response(Response {
            request_id,
            outcome: Outcome::Result(result),
        })
    }

    pub fn error(request_id: Value, error: impl Into<String>) -> Self {
        ServerMessage::Response(Response {
            request_id,
            outcome: Outcome::Error(error.into()),
        })
    }

    pub fn event(session_id: impl Into<String>, event: TerminalEvent) -> Self {
        ServerMessage::Event(EventFrame {
            session_id: session_id.into(),
            event,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use test_case::test_case;

    fn request(frame: Value) -> Result<Request> {
        Request::from_frame(serde_json::from_value(frame).expect("frame shape"))
    }

    #[test]
    fn create_or_attach_flattens_options() {
        let parsed = request(json!({
            "requestId": 1,
            "method": "createOrAttach",
            "params": {"id": "pane-1", "cwd": "/tmp", "cols": 100, "initialCommands": ["ls"]}
        }))
        .expect("valid request");

        let Request::CreateOrAttach(params) = parsed else {
            panic!("expected createOrAttach");
        };
        assert_eq!(params.id, "pane-1");
        assert_eq!(params.options.cols, Some(100));
        assert_eq!(params.options.rows, None);
        assert_eq!(params.options.initial_commands, vec!["ls".to_string()]);
    }

    #[test]
    fn kill_accepts_delete_history() {
        let parsed = request(json!({
            "requestId": 2,
            "method": "kill",
            "params": {"id": "p", "deleteHistory": true}
        }))
        .expect("valid request");
        assert_eq!(
            parsed,
            Request::Kill(KillParams {
                id: "p".into(),
                options: KillOptions {
                    delete_history: true
                }
            })
        );
    }

    #[test]
    fn list_sessions_needs_no_params() {
        assert_eq!(
            request(json!({"requestId": 3, "method": "listSessions"})).expect("valid"),
            Request::ListSessions
        );
    }

    #[test_case(json!({"method": "write", "params": {"id": "", "data": "x"}}), "empty"; "empty id")]
    #[test_case(json!({"method": "write", "params": {"id": "x".repeat(257), "data": "x"}}), "limit"; "long id")]
    #[test_case(json!({"method": "resize", "params": {"id": "p", "cols": 0, "rows": 24}}), "invalid size"; "zero cols")]
    #[test_case(json!({"method": "createOrAttach", "params": {"id": "p", "rows": 0}}), "non-zero"; "zero rows on create")]
    #[test_case(json!({"method": "explode", "params": {}}), "unknown method"; "unknown method")]
    #[test_case(json!({"method": "write"}), "missing params"; "missing params")]
    #[test_case(json!({"method": "write", "params": {"id": "p"}}), "invalid params"; "missing field")]
    fn invalid_requests_are_rejected(frame: Value, expected: &str) {
        let error = request(frame).expect_err("should be rejected");
        assert!(
            format!("{:#}", error).contains(expected),
            "error {:#} should mention {:?}",
            error,
            expected
        );
    }

    #[test]
    fn response_frames() {
        assert_eq!(
            serde_json::to_value(ServerMessage::result(json!(7), json!({"isNew": true})))
                .expect("serializable"),
            json!({"type": "response", "requestId": 7, "result": {"isNew": true}})
        );
        assert_eq!(
            serde_json::to_value(ServerMessage::error(Value::Null, "bad frame"))
                .expect("serializable"),
            json!({"type": "response", "requestId": null, "error": "bad frame"})
        );
    }

    #[test]
    fn event_frames() {
        let message = ServerMessage::event("pane", TerminalEvent::Data { data: "hi".into() });
        assert_eq!(
            serde_json::to_value(message).expect("serializable"),
            json!({"type": "event", "sessionId": "pane", "event": {"type": "data", "data": "hi"}})
        );
    }
}
