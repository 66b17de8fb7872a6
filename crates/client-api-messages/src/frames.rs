//! Tagged-array frame model.

use serde_json::{Value, json};

use crate::pipeline::FrameError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubKind {
    Get,
    Range,
}

/// A decoded client → server frame.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientMessage {
    /// `["rpc", endpoint, args...]`
    Rpc { endpoint: String, args: Vec<Value> },
    /// `["sub", component, "get" | "range", args...]`
    Sub {
        component: String,
        kind: SubKind,
        args: Vec<Value>,
    },
    /// `["unsub", sub_id]`
    Unsub { sub_id: String },
    /// `["motd"]`
    Motd,
}

impl ClientMessage {
    pub fn from_value(value: Value) -> Result<Self, FrameError> {
        let Value::Array(mut parts) = value else {
            return Err(FrameError::Malformed("frame is not an array".into()));
        };
        if parts.is_empty() {
            return Err(FrameError::Malformed("empty frame".into()));
        }
        let tag = parts.remove(0);
        let tag = tag
            .as_str()
            .ok_or_else(|| FrameError::Malformed("frame tag is not a string".into()))?
            .to_owned();
        match tag.as_str() {
            "rpc" => {
                if parts.is_empty() {
                    return Err(FrameError::Malformed("rpc frame without endpoint".into()));
                }
                let endpoint = take_string(parts.remove(0), "endpoint")?;
                Ok(ClientMessage::Rpc {
                    endpoint,
                    args: parts,
                })
            }
            "sub" => {
                if parts.len() < 2 {
                    return Err(FrameError::Malformed("sub frame too short".into()));
                }
                let component = take_string(parts.remove(0), "component")?;
                let kind = match take_string(parts.remove(0), "sub kind")?.as_str() {
                    "get" => SubKind::Get,
                    "range" => SubKind::Range,
                    other => {
                        return Err(FrameError::Malformed(format!("unknown sub kind `{other}`")));
                    }
                };
                Ok(ClientMessage::Sub {
                    component,
                    kind,
                    args: parts,
                })
            }
            "unsub" => {
                if parts.is_empty() {
                    return Err(FrameError::Malformed("unsub frame without id".into()));
                }
                let sub_id = take_string(parts.remove(0), "sub id")?;
                Ok(ClientMessage::Unsub { sub_id })
            }
            "motd" => Ok(ClientMessage::Motd),
            other => Err(FrameError::Malformed(format!("unknown frame tag `{other}`"))),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            ClientMessage::Rpc { endpoint, args } => {
                let mut parts = vec![json!("rpc"), json!(endpoint)];
                parts.extend(args.iter().cloned());
                Value::Array(parts)
            }
            ClientMessage::Sub {
                component,
                kind,
                args,
            } => {
                let kind = match kind {
                    SubKind::Get => "get",
                    SubKind::Range => "range",
                };
                let mut parts = vec![json!("sub"), json!(component), json!(kind)];
                parts.extend(args.iter().cloned());
                Value::Array(parts)
            }
            ClientMessage::Unsub { sub_id } => json!(["unsub", sub_id]),
            ClientMessage::Motd => json!(["motd"]),
        }
    }
}

fn take_string(v: Value, what: &str) -> Result<String, FrameError> {
    match v {
        Value::String(s) => Ok(s),
        other => Err(FrameError::Malformed(format!(
            "{what} is not a string: {other}"
        ))),
    }
}

/// A server → client frame.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerMessage {
    /// Reply to an `rpc` frame; `"ok"` when the endpoint returned nothing.
    Rsp(Value),
    /// Subscription acknowledged with its initial data.
    Sub { sub_id: String, initial: Value },
    /// Delta push: row id (as string) → row dict or null.
    Updt {
        sub_id: String,
        rows: serde_json::Map<String, Value>,
    },
    Motd(String),
}

impl ServerMessage {
    pub fn ok() -> Self {
        ServerMessage::Rsp(json!("ok"))
    }

    /// Error reply for endpoints that opted into error delivery.
    pub fn error(kind: &str, message: &str) -> Self {
        ServerMessage::Rsp(json!({ "error": kind, "message": message }))
    }

    pub fn to_value(&self) -> Value {
        match self {
            ServerMessage::Rsp(v) => json!(["rsp", v]),
            ServerMessage::Sub { sub_id, initial } => json!(["sub", sub_id, initial]),
            ServerMessage::Updt { sub_id, rows } => json!(["updt", sub_id, rows]),
            ServerMessage::Motd(text) => json!(["motd", text]),
        }
    }

    pub fn from_value(value: Value) -> Result<Self, FrameError> {
        let Value::Array(mut parts) = value else {
            return Err(FrameError::Malformed("frame is not an array".into()));
        };
        if parts.is_empty() {
            return Err(FrameError::Malformed("empty frame".into()));
        }
        let tag = take_string(parts.remove(0), "frame tag")?;
        match (tag.as_str(), parts.len()) {
            ("rsp", 1..) => Ok(ServerMessage::Rsp(parts.remove(0))),
            ("sub", 2..) => {
                let sub_id = take_string(parts.remove(0), "sub id")?;
                Ok(ServerMessage::Sub {
                    sub_id,
                    initial: parts.remove(0),
                })
            }
            ("updt", 2..) => {
                let sub_id = take_string(parts.remove(0), "sub id")?;
                match parts.remove(0) {
                    Value::Object(rows) => Ok(ServerMessage::Updt { sub_id, rows }),
                    _ => Err(FrameError::Malformed("updt rows is not an object".into())),
                }
            }
            ("motd", 1..) => Ok(ServerMessage::Motd(take_string(parts.remove(0), "motd")?)),
            _ => Err(FrameError::Malformed(format!("bad `{tag}` frame"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn client_frames_round_trip() {
        let frames = [
            ClientMessage::Rpc {
                endpoint: "login".into(),
                args: vec![json!(1), json!("pw")],
            },
            ClientMessage::Sub {
                component: "Item".into(),
                kind: SubKind::Range,
                args: vec![json!("owner"), json!(10), json!(10), json!(100)],
            },
            ClientMessage::Unsub {
                sub_id: "Item.owner[10:10:1][:100]".into(),
            },
            ClientMessage::Motd,
        ];
        for frame in frames {
            assert_eq!(ClientMessage::from_value(frame.to_value()).unwrap(), frame);
        }
    }

    #[test]
    fn malformed_frames_rejected() {
        assert!(ClientMessage::from_value(json!({})).is_err());
        assert!(ClientMessage::from_value(json!([])).is_err());
        assert!(ClientMessage::from_value(json!(["bogus"])).is_err());
        assert!(ClientMessage::from_value(json!(["sub", "Item", "nearest"])).is_err());
    }

    #[test]
    fn server_frames_round_trip() {
        let mut rows = serde_json::Map::new();
        rows.insert("7".into(), Value::Null);
        let frames = [
            ServerMessage::ok(),
            ServerMessage::error("RACE", "lost"),
            ServerMessage::Sub {
                sub_id: "s".into(),
                initial: json!([{"id": 7}]),
            },
            ServerMessage::Updt {
                sub_id: "s".into(),
                rows,
            },
            ServerMessage::Motd("hello".into()),
        ];
        for frame in frames {
            assert_eq!(ServerMessage::from_value(frame.to_value()).unwrap(), frame);
        }
    }
}
