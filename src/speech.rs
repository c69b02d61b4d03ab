//! Spoken replies: Google Translate TTS synthesis + external player.
//!
//! Pipeline per reply:
//! 1. Text → chunks of at most 100 chars (sentences, then words)
//! 2. Chunk → batchexecute `jQ1olc` RPC → base64 MP3 frames
//! 3. Frames → fresh `tmp_*.mp3` file
//! 4. File → `mpg123 -q` (or the configured player), then the file is removed

use std::io;
use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::Client;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{PlaybackConfig, TtsConfig};

/// Longest text the TTS endpoint accepts per request.
const MAX_CHUNK_CHARS: usize = 100;
const RPC_ID: &str = "jQ1olc";
const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

#[derive(Debug, Error)]
pub enum SpeechError {
    #[error("TTS request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TTS endpoint returned status {0}")]
    Status(u16),

    #[error("TTS response contained no audio")]
    NoAudio,

    #[error("TTS audio is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("failed to encode TTS request: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("audio file error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to start audio player '{program}': {source}")]
    Spawn { program: String, source: io::Error },
}

/// Turns text into a playable audio file.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, path: &Path) -> Result<(), SpeechError>;
}

/// Plays an audio file to completion.
#[async_trait]
pub trait Player: Send + Sync {
    async fn play(&self, path: &Path) -> Result<(), SpeechError>;
}

/// Says a reply out loud.
#[async_trait]
pub trait VoiceOutput: Send + Sync {
    async fn say(&self, text: &str) -> Result<(), SpeechError>;
}

/// Build the voice output described by the config. Disabled TTS yields [`Mute`].
pub fn from_config(
    tts: &TtsConfig,
    playback: &PlaybackConfig,
) -> Result<Box<dyn VoiceOutput>, SpeechError> {
    if !tts.enabled {
        info!("TTS disabled, replies will only be printed");
        return Ok(Box::new(Mute));
    }
    Ok(Box::new(Speaker::new(
        Box::new(GoogleTts::new(tts)?),
        Box::new(CommandPlayer::new(playback)),
    )))
}

/// Synthesize into a per-reply temp file, play it, remove it.
pub struct Speaker {
    synth: Box<dyn Synthesizer>,
    player: Box<dyn Player>,
}

impl Speaker {
    pub fn new(synth: Box<dyn Synthesizer>, player: Box<dyn Player>) -> Self {
        Self { synth, player }
    }
}

#[async_trait]
impl VoiceOutput for Speaker {
    async fn say(&self, text: &str) -> Result<(), SpeechError> {
        if text.trim().is_empty() {
            debug!("Nothing to say");
            return Ok(());
        }

        // Removed on drop, including the early returns below.
        let audio = tempfile::Builder::new()
            .prefix("tmp_")
            .suffix(".mp3")
            .tempfile()?;

        let t_synth = Instant::now();
        self.synth.synthesize(text, audio.path()).await?;
        let synth_ms = t_synth.elapsed().as_secs_f64() * 1000.0;

        let t_play = Instant::now();
        self.player.play(audio.path()).await?;
        let play_ms = t_play.elapsed().as_secs_f64() * 1000.0;

        debug!(
            "Spoke {} chars (synth={synth_ms:.0}ms play={play_ms:.0}ms)",
            text.chars().count()
        );
        Ok(())
    }
}

/// Voice output that says nothing.
pub struct Mute;

#[async_trait]
impl VoiceOutput for Mute {
    async fn say(&self, _text: &str) -> Result<(), SpeechError> {
        Ok(())
    }
}

/// Google Translate TTS, the service gTTS talks to.
pub struct GoogleTts {
    client: Client,
    endpoint: String,
    lang: String,
    slow: bool,
}

impl GoogleTts {
    pub fn new(config: &TtsConfig) -> Result<Self, SpeechError> {
        let client = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint_url(),
            lang: config.lang.clone(),
            slow: config.slow,
        })
    }

    /// `f.req` form value for one chunk.
    fn rpc_payload(&self, chunk: &str) -> Result<String, SpeechError> {
        let speed = if self.slow { Value::Bool(true) } else { Value::Null };
        let parameter = serde_json::to_string(&json!([chunk, self.lang, speed, "null"]))?;
        Ok(serde_json::to_string(&json!([[[RPC_ID, parameter, null, "generic"]]]))?)
    }

    async fn fetch_chunk(&self, chunk: &str) -> Result<Vec<u8>, SpeechError> {
        let payload = self.rpc_payload(chunk)?;
        let resp = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::REFERER, "http://translate.google.com/")
            .form(&[("f.req", payload)])
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(SpeechError::Status(resp.status().as_u16()));
        }
        let body = resp.text().await?;
        extract_audio(&body)
    }
}

#[async_trait]
impl Synthesizer for GoogleTts {
    async fn synthesize(&self, text: &str, path: &Path) -> Result<(), SpeechError> {
        let chunks = split_chunks(text, MAX_CHUNK_CHARS);
        let mut audio = Vec::new();

        for (i, chunk) in chunks.iter().enumerate() {
            let bytes = self.fetch_chunk(chunk).await?;
            if bytes.is_empty() {
                return Err(SpeechError::NoAudio);
            }
            debug!("Chunk {}/{}: {} bytes of audio", i + 1, chunks.len(), bytes.len());
            audio.extend(bytes);
        }

        if audio.is_empty() {
            return Err(SpeechError::NoAudio);
        }
        tokio::fs::write(path, &audio).await?;
        Ok(())
    }
}

/// Pull the base64 MP3 payloads out of a batchexecute response.
///
/// The body is a `)]}'` guard followed by length-prefixed JSON lines; the
/// audio sits in `[["wrb.fr","jQ1olc","[\"<base64>\"]",...]]`.
fn extract_audio(body: &str) -> Result<Vec<u8>, SpeechError> {
    let mut audio = Vec::new();
    for line in body.lines().filter(|line| line.contains(RPC_ID)) {
        let Ok(Value::Array(entries)) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        for entry in &entries {
            if entry.get(1).and_then(Value::as_str) != Some(RPC_ID) {
                continue;
            }
            let Some(payload) = entry.get(2).and_then(Value::as_str) else {
                continue;
            };
            let Ok(Value::Array(inner)) = serde_json::from_str::<Value>(payload) else {
                continue;
            };
            if let Some(encoded) = inner.first().and_then(Value::as_str) {
                audio.extend(STANDARD.decode(encoded)?);
            }
        }
    }
    Ok(audio)
}

/// Plays files by running an external program, `mpg123 -q <file>` by default.
pub struct CommandPlayer {
    command: String,
    args: Vec<String>,
}

impl CommandPlayer {
    pub fn new(config: &PlaybackConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
        }
    }
}

#[async_trait]
impl Player for CommandPlayer {
    async fn play(&self, path: &Path) -> Result<(), SpeechError> {
        let status = tokio::process::Command::new(&self.command)
            .args(&self.args)
            .arg(path)
            .status()
            .await
            .map_err(|source| SpeechError::Spawn {
                program: self.command.clone(),
                source,
            })?;

        if !status.success() {
            warn!("{} exited with {status}", self.command);
        }
        Ok(())
    }
}

/// Split text into chunks of at most `max_chars` characters, preferring
/// sentence boundaries, then word boundaries.
pub fn split_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();

    for sentence in split_sentences(text.trim()) {
        if sentence.chars().count() <= max_chars {
            chunks.push(sentence.to_string());
            continue;
        }

        let mut current = String::new();
        let mut current_len = 0;
        for token in sentence
            .split_whitespace()
            .flat_map(|word| hard_split(word, max_chars))
        {
            let len = token.chars().count();
            if current_len > 0 && current_len + 1 + len > max_chars {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            if current_len > 0 {
                current.push(' ');
                current_len += 1;
            }
            current.push_str(&token);
            current_len += len;
        }
        if !current.is_empty() {
            chunks.push(current);
        }
    }

    chunks
}

fn hard_split(word: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = word.chars().collect();
    chars
        .chunks(max_chars.max(1))
        .map(|piece| piece.iter().collect())
        .collect()
}

/// Sentences of `text`, each ending at a `.`, `!`, `?` or `…` that is
/// followed by whitespace.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        let ends_sentence = matches!(c, '.' | '!' | '?' | '…')
            && chars.peek().is_some_and(|&(_, next)| next.is_whitespace());
        if ends_sentence {
            let end = i + c.len_utf8();
            sentences.push(&text[start..end]);
            start = end;
        }
    }
    sentences.push(&text[start..]);

    sentences
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}
