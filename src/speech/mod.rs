//! # Speech Module
//!
//! Both directions of speech: synthesis for voice-mode answers and
//! continuous transcription for the microphone WebSocket.
//!
//! ## Key Components:
//! - **synthesis**: `SpeechSynthesizer` seam and the hosted SSML client
//! - **stream_source**: Audio push channel (session writes, engine reads)
//! - **recognizer**: `RecognitionEngine` / `RecognizerFactory` seam and callbacks
//! - **segmenting**: Continuous recognizer over a hosted segment transcriber
//! - **queue**: Result queue between the callback thread and the send loop
//! - **session**: `TranscriptionSession` state machine
//! - **send_loop**: `NetworkSendLoop`, queue → client connection
//!
//! ## Transcription data flow:
//! ```text
//! WebSocket binary frame → TranscriptionSession::feed → AudioStreamWriter
//!     → AudioStreamReader → RecognitionEngine (own thread)
//!     → callbacks → ResultQueue → NetworkSendLoop → WebSocket text frame
//! ```

pub mod queue;
pub mod recognizer;
pub mod segmenting;
pub mod send_loop;
pub mod session;
pub mod stream_source;
pub mod synthesis;
