//! Session wiring: model handle, context load, conversation, persistence.

use std::io::{BufRead, Write};

use thiserror::Error;
use tracing::info;

use crate::config::Config;
use crate::context::{self, ContextError, ContextStore, Replaced};
use crate::conversation::{Conversation, ConversationError};
use crate::llm::{ChatModel, LlmError, OllamaChat};
use crate::speech::{self, SpeechError, VoiceOutput};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Speech(#[from] SpeechError),

    #[error(transparent)]
    Conversation(#[from] ConversationError),
}

/// What a finished session left behind.
#[derive(Debug)]
pub struct SessionOutcome {
    pub turns: usize,
    pub replaced: Replaced,
}

/// Run an interactive session on stdin/stdout.
pub async fn run(
    model_name: &str,
    context_filename: &str,
    config: &Config,
) -> Result<SessionOutcome, SessionError> {
    let chat = OllamaChat::new(model_name, &config.ollama)?;
    info!("Chatting with '{}' at {}", chat.model(), config.ollama.host);

    let voice = speech::from_config(&config.tts, &config.playback)?;
    let store = ContextStore::new(config.contexts.dir.clone());
    info!("Saving conversations under {}", store.dir().display());

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    converse(
        &chat,
        voice.as_ref(),
        &store,
        context_filename,
        stdin.lock(),
        stdout.lock(),
    )
    .await
}

/// Load the named context (if any), converse, then save the result and
/// retire the file that was loaded.
pub async fn converse<R: BufRead, W: Write>(
    chat: &dyn ChatModel,
    voice: &dyn VoiceOutput,
    store: &ContextStore,
    context_filename: &str,
    input: R,
    output: W,
) -> Result<SessionOutcome, SessionError> {
    let use_context = !context_filename.is_empty();
    let context = context::load_context(context_filename, use_context)?;

    let context = Conversation::new(chat, voice, context)
        .run(input, output)
        .await?;

    let replaced = store.replace(&context, use_context.then_some(context_filename))?;
    match &replaced.saved {
        Some(path) => info!("Conversation saved to {}", path.display()),
        None => info!("Nothing to save"),
    }

    Ok(SessionOutcome {
        turns: context.len(),
        replaced,
    })
}
