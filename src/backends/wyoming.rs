//! Minimal Wyoming protocol client for speech-to-text servers (e.g. wyoming-faster-whisper).
//!
//! Events are a JSON header line, optionally followed by `data_length` bytes of extra JSON data
//! and `payload_length` bytes of binary payload.

use crate::error::ServiceError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

const SERVICE: &str = "wyoming";
/// Samples per audio-chunk event.
const CHUNK_SAMPLES: usize = 1024;
/// Largest data or payload block accepted from a server.
const MAX_EVENT_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
pub struct WyomingEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_length: Option<usize>,
}

fn io_error(e: impl ToString) -> ServiceError {
    ServiceError::unavailable(SERVICE, e)
}

pub struct WyomingClient {
    stream: BufReader<TcpStream>,
}

impl WyomingClient {
    pub async fn connect(host: &str, port: u16) -> Result<Self, ServiceError> {
        let stream = TcpStream::connect(format!("{}:{}", host, port))
            .await
            .map_err(io_error)?;
        let mut client = Self {
            stream: BufReader::new(stream),
        };

        client.write_event("describe", None, &[]).await?;
        let info = client.read_event().await?;
        debug!("Wyoming: server answered describe with '{}'", info.event_type);
        Ok(client)
    }

    /// Send one utterance worth of 16-bit mono PCM and wait for its transcript.
    pub async fn transcribe(&mut self, pcm: &[i16], rate: u32) -> Result<String, ServiceError> {
        self.write_event("transcribe", None, &[]).await?;
        self.write_event(
            "audio-start",
            Some(json!({"rate": rate, "width": 2, "channels": 1})),
            &[],
        )
        .await?;
        for block in pcm.chunks(CHUNK_SAMPLES) {
            let bytes: Vec<u8> = block.iter().flat_map(|s| s.to_le_bytes()).collect();
            self.write_event(
                "audio-chunk",
                Some(json!({"rate": rate, "width": 2, "channels": 1})),
                &bytes,
            )
            .await?;
        }
        self.write_event("audio-stop", None, &[]).await?;
        self.wait_for_transcript().await
    }

    async fn wait_for_transcript(&mut self) -> Result<String, ServiceError> {
        loop {
            let event = self.read_event().await?;
            if event.event_type == "transcript" {
                let text = event
                    .data
                    .as_ref()
                    .and_then(|d| d.get("text"))
                    .and_then(|t| t.as_str())
                    .ok_or_else(|| ServiceError::malformed(SERVICE, "transcript without text"))?;
                return Ok(text.trim().to_string());
            }
            if event.event_type == "error" {
                return Err(ServiceError::unavailable(
                    SERVICE,
                    event.data.map(|d| d.to_string()).unwrap_or_default(),
                ));
            }
        }
    }

    async fn write_event(
        &mut self,
        event_type: &str,
        data: Option<serde_json::Value>,
        payload: &[u8],
    ) -> Result<(), ServiceError> {
        let event = WyomingEvent {
            event_type: event_type.to_string(),
            data,
            data_length: None,
            payload_length: (!payload.is_empty()).then_some(payload.len()),
        };
        let mut line = serde_json::to_vec(&event).map_err(io_error)?;
        line.push(b'\n');

        let stream = self.stream.get_mut();
        stream.write_all(&line).await.map_err(io_error)?;
        if !payload.is_empty() {
            stream.write_all(payload).await.map_err(io_error)?;
        }
        Ok(())
    }

    async fn read_event(&mut self) -> Result<WyomingEvent, ServiceError> {
        let mut line = String::new();
        let n = self.stream.read_line(&mut line).await.map_err(io_error)?;
        if n == 0 {
            return Err(io_error("connection closed"));
        }
        let mut event: WyomingEvent =
            serde_json::from_str(&line).map_err(|e| ServiceError::malformed(SERVICE, e))?;

        for (field, len) in [("data_length", event.data_length), ("payload_length", event.payload_length)] {
            if let Some(len) = len.filter(|len| *len > MAX_EVENT_BYTES) {
                return Err(ServiceError::malformed(
                    SERVICE,
                    format!("{} of {} bytes exceeds the {} byte limit", field, len, MAX_EVENT_BYTES),
                ));
            }
        }
        if let Some(len) = event.data_length {
            let mut buf = vec![0u8; len];
            self.stream.read_exact(&mut buf).await.map_err(io_error)?;
            let extra: serde_json::Value =
                serde_json::from_slice(&buf).map_err(|e| ServiceError::malformed(SERVICE, e))?;
            event.data = Some(match (event.data.take(), extra) {
                (Some(serde_json::Value::Object(mut inline)), serde_json::Value::Object(more)) => {
                    inline.extend(more);
                    serde_json::Value::Object(inline)
                }
                (_, extra) => extra,
            });
        }
        if let Some(len) = event.payload_length {
            let mut buf = vec![0u8; len];
            self.stream.read_exact(&mut buf).await.map_err(io_error)?;
        }
        Ok(event)
    }
}
