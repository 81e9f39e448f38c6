use base64::Engine;
use serde::{Deserialize, Serialize};

use super::{Speaker, TransportEvent};
use crate::audio::{AudioFrame, OUTPUT_SAMPLE_RATE};
use crate::error::TransportError;

/// Handshake request sent on `<prefix>.session.open`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOpenRequest {
    pub session_id: String,
    pub voice: String,
    pub system_instruction: String,
    pub input_format: String,
    pub output_format: String,
}

impl SessionOpenRequest {
    pub fn new(session_id: String, voice: &str, system_instruction: &str, input_rate: u32, output_rate: u32) -> Self {
        Self {
            session_id,
            voice: voice.to_string(),
            system_instruction: system_instruction.to_string(),
            input_format: format!("pcm16le;rate={}", input_rate),
            output_format: format!("pcm16le;rate={}", output_rate),
        }
    }
}

/// Reply to the handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOpenReply {
    pub accepted: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Audio frame published on `<prefix>.audio.in.<session_id>`
#[derive(Debug, Serialize, Deserialize)]
pub struct AudioFrameMessage {
    pub session_id: String,
    pub sequence: u64,
    pub pcm: String, // Base64-encoded PCM16LE
    pub sample_rate: u32,
    pub channels: u16,
    pub timestamp: String, // RFC3339
}

impl AudioFrameMessage {
    pub fn from_frame(session_id: &str, frame: &AudioFrame) -> Self {
        Self {
            session_id: session_id.to_string(),
            sequence: frame.sequence,
            pcm: base64::engine::general_purpose::STANDARD.encode(&frame.payload),
            sample_rate: frame.sample_rate,
            channels: 1,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Event published by the voice service on `<prefix>.events.<session_id>`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Audio {
        sequence: u64,
        pcm: String,
        #[serde(default = "default_output_rate")]
        sample_rate: u32,
    },
    Transcript {
        role: Speaker,
        text: String,
    },
    Interrupted,
    Closed {
        #[serde(default)]
        reason: String,
    },
}

fn default_output_rate() -> u32 {
    OUTPUT_SAMPLE_RATE
}

impl ServerEvent {
    pub fn parse(payload: &[u8]) -> Result<Self, TransportError> {
        serde_json::from_slice(payload).map_err(|e| TransportError::Protocol(e.to_string()))
    }

    pub fn into_event(self) -> Result<TransportEvent, TransportError> {
        match self {
            ServerEvent::Audio {
                sequence,
                pcm,
                sample_rate,
            } => {
                let payload = base64::engine::general_purpose::STANDARD
                    .decode(pcm.as_bytes())
                    .map_err(|e| TransportError::Protocol(format!("bad audio payload: {}", e)))?;

                Ok(TransportEvent::Audio(AudioFrame {
                    payload,
                    sample_rate,
                    sequence,
                }))
            }
            ServerEvent::Transcript { role, text } => Ok(TransportEvent::Transcript { speaker: role, text }),
            ServerEvent::Interrupted => Ok(TransportEvent::Interrupted),
            ServerEvent::Closed { reason } => Ok(TransportEvent::Closed { reason }),
        }
    }
}

/// Published on `<prefix>.session.close` when the client hangs up
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionCloseMessage {
    pub session_id: String,
    pub timestamp: String,
}

impl SessionCloseMessage {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_audio_event() {
        let pcm = base64::engine::general_purpose::STANDARD.encode([0x01u8, 0x00, 0xff, 0x7f]);
        let json = format!(r#"{{"type":"audio","sequence":7,"pcm":"{}"}}"#, pcm);

        let event = ServerEvent::parse(json.as_bytes()).unwrap().into_event().unwrap();
        match event {
            TransportEvent::Audio(frame) => {
                assert_eq!(frame.sequence, 7);
                assert_eq!(frame.sample_rate, 24000);
                assert_eq!(frame.pcm16(), vec![1, i16::MAX]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_parse_control_events() {
        let transcript = ServerEvent::parse(br#"{"type":"transcript","role":"model","text":"Hello"}"#)
            .unwrap()
            .into_event()
            .unwrap();
        assert_eq!(
            transcript,
            TransportEvent::Transcript {
                speaker: Speaker::Model,
                text: "Hello".to_string()
            }
        );

        let interrupted = ServerEvent::parse(br#"{"type":"interrupted"}"#).unwrap().into_event().unwrap();
        assert_eq!(interrupted, TransportEvent::Interrupted);

        let closed = ServerEvent::parse(br#"{"type":"closed"}"#).unwrap().into_event().unwrap();
        assert_eq!(closed, TransportEvent::Closed { reason: String::new() });
    }

    #[test]
    fn test_bad_payloads_are_protocol_errors() {
        assert!(matches!(
            ServerEvent::parse(b"not json"),
            Err(TransportError::Protocol(_))
        ));

        let event = ServerEvent::Audio {
            sequence: 0,
            pcm: "***".to_string(),
            sample_rate: 24000,
        };
        assert!(matches!(event.into_event(), Err(TransportError::Protocol(_))));
    }

    #[test]
    fn test_audio_message_fields() {
        let frame = AudioFrame::from_pcm16(&[1, 2, 3], 16000, 42);
        let message = AudioFrameMessage::from_frame("voice-1", &frame);
        let value = serde_json::to_value(&message).unwrap();

        let mut keys: Vec<&str> = value.as_object().unwrap().keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            vec!["channels", "pcm", "sample_rate", "sequence", "session_id", "timestamp"]
        );
        assert_eq!(value["sequence"], 42);
        assert_eq!(value["sample_rate"], 16000);
        assert_eq!(value["channels"], 1);
    }

    #[test]
    fn test_open_request_formats() {
        let request = SessionOpenRequest::new("voice-1".to_string(), "Kore", "Be brief.", 16000, 24000);
        assert_eq!(request.input_format, "pcm16le;rate=16000");
        assert_eq!(request.output_format, "pcm16le;rate=24000");
        assert_eq!(request.voice, "Kore");
    }
}
