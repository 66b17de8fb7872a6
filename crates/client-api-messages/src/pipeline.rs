//! The layered frame pipeline.
//!
//! Outbound frames serialize to msgpack and pass through the layer stack in
//! order; inbound frames pass through in reverse and deserialize. The layers
//! shipped here are the size limit and the binary codec; streaming
//! compression and AEAD encryption implement [`FrameLayer`] in their own
//! crates and exchange their handshake contexts in stack order.

use serde_json::Value;
use thiserror::Error;

use crate::frames::{ClientMessage, ServerMessage};

/// Maximum frame size after decoding.
pub const MAX_FRAME_SIZE: usize = 10240;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    TooLarge(usize),
    #[error("codec error: {0}")]
    Codec(String),
}

/// One transform stage over raw frame bytes.
pub trait FrameLayer: Send + Sync {
    fn name(&self) -> &'static str;
    fn outbound(&self, data: Vec<u8>) -> Result<Vec<u8>, FrameError>;
    fn inbound(&self, data: Vec<u8>) -> Result<Vec<u8>, FrameError>;
    /// Context exchanged during the connection handshake, in stack order.
    fn handshake(&self) -> Option<Value> {
        None
    }
}

/// Rejects oversized frames in both directions.
pub struct LimitLayer {
    max: usize,
}

impl LimitLayer {
    pub fn new(max: usize) -> Self {
        LimitLayer { max }
    }
}

impl Default for LimitLayer {
    fn default() -> Self {
        LimitLayer::new(MAX_FRAME_SIZE)
    }
}

impl FrameLayer for LimitLayer {
    fn name(&self) -> &'static str {
        "limit"
    }

    fn outbound(&self, data: Vec<u8>) -> Result<Vec<u8>, FrameError> {
        Ok(data)
    }

    fn inbound(&self, data: Vec<u8>) -> Result<Vec<u8>, FrameError> {
        if data.len() > self.max {
            return Err(FrameError::TooLarge(data.len()));
        }
        Ok(data)
    }
}

/// The full pipeline: msgpack codec innermost, then the layer stack.
pub struct MessagePipeline {
    layers: Vec<Box<dyn FrameLayer>>,
}

impl Default for MessagePipeline {
    fn default() -> Self {
        MessagePipeline {
            layers: vec![Box::new(LimitLayer::default())],
        }
    }
}

impl MessagePipeline {
    pub fn new(layers: Vec<Box<dyn FrameLayer>>) -> Self {
        MessagePipeline { layers }
    }

    pub fn handshakes(&self) -> Vec<(&'static str, Option<Value>)> {
        self.layers
            .iter()
            .map(|l| (l.name(), l.handshake()))
            .collect()
    }

    fn pack(value: &Value) -> Result<Vec<u8>, FrameError> {
        rmp_serde::to_vec(value).map_err(|e| FrameError::Codec(e.to_string()))
    }

    fn unpack(data: &[u8]) -> Result<Value, FrameError> {
        rmp_serde::from_slice(data).map_err(|e| FrameError::Codec(e.to_string()))
    }

    pub fn encode(&self, msg: &ServerMessage) -> Result<Vec<u8>, FrameError> {
        let mut data = Self::pack(&msg.to_value())?;
        for layer in &self.layers {
            data = layer.outbound(data)?;
        }
        Ok(data)
    }

    pub fn decode(&self, frame: Vec<u8>) -> Result<ClientMessage, FrameError> {
        let mut data = frame;
        for layer in self.layers.iter().rev() {
            data = layer.inbound(data)?;
        }
        ClientMessage::from_value(Self::unpack(&data)?)
    }

    /// The client-side direction, for SDKs and tests.
    pub fn encode_client(&self, msg: &ClientMessage) -> Result<Vec<u8>, FrameError> {
        let mut data = Self::pack(&msg.to_value())?;
        for layer in &self.layers {
            data = layer.outbound(data)?;
        }
        Ok(data)
    }

    pub fn decode_server(&self, frame: Vec<u8>) -> Result<ServerMessage, FrameError> {
        let mut data = frame;
        for layer in self.layers.iter().rev() {
            data = layer.inbound(data)?;
        }
        ServerMessage::from_value(Self::unpack(&data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::SubKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn pipeline_round_trip() {
        let pipeline = MessagePipeline::default();
        let msg = ClientMessage::Sub {
            component: "Item".into(),
            kind: SubKind::Get,
            args: vec![json!("id"), json!(7)],
        };
        let bytes = pipeline.encode_client(&msg).unwrap();
        assert_eq!(pipeline.decode(bytes).unwrap(), msg);

        let reply = ServerMessage::Sub {
            sub_id: "Item.id[7:None:1][:1]".into(),
            initial: json!({"id": 7, "qty": 1}),
        };
        let bytes = pipeline.encode(&reply).unwrap();
        assert_eq!(pipeline.decode_server(bytes).unwrap(), reply);
    }

    #[test]
    fn oversized_frames_rejected() {
        let pipeline = MessagePipeline::default();
        let msg = ClientMessage::Rpc {
            endpoint: "spam".into(),
            args: vec![json!("x".repeat(MAX_FRAME_SIZE))],
        };
        let bytes = pipeline.encode_client(&msg).unwrap();
        assert!(matches!(
            pipeline.decode(bytes).unwrap_err(),
            FrameError::TooLarge(_)
        ));
    }
}
