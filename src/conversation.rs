//! Conversation loop with a two-state machine.
//!
//! RUNNING → TERMINATED
//!
//! Each RUNNING iteration reads one line, asks the model, prints and speaks
//! the reply, and appends the turn. An exit keyword (or end of input) ends
//! the loop and hands the context back for saving.

use std::io::{self, BufRead, Write};

use thiserror::Error;
use tracing::{debug, info};

use crate::context::Context;
use crate::llm::{ChatModel, LlmError};
use crate::speech::{SpeechError, VoiceOutput};

pub const EXIT_KEYWORDS: [&str; 4] = ["quit", "exit", "q", "bye"];

const PROMPT: &str = "User: ";
const FAREWELL: &str = "AI: Goodbye!";

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("terminal I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Speech(#[from] SpeechError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Terminated,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::Terminated => write!(f, "TERMINATED"),
        }
    }
}

/// Whether `input` asks to end the conversation.
pub fn is_exit_command(input: &str) -> bool {
    let input = input.trim().to_lowercase();
    EXIT_KEYWORDS.contains(&input.as_str())
}

/// Print every turn of `context`, oldest first.
pub fn replay<W: Write>(context: &Context, out: &mut W) -> io::Result<()> {
    for turn in context.turns() {
        writeln!(out, "User: {}\nAI: {}\n", turn.user, turn.ai)?;
    }
    Ok(())
}

pub struct Conversation<'a> {
    chat: &'a dyn ChatModel,
    voice: &'a dyn VoiceOutput,
    context: Context,
    state: LoopState,
}

impl<'a> Conversation<'a> {
    pub fn new(chat: &'a dyn ChatModel, voice: &'a dyn VoiceOutput, context: Context) -> Self {
        Self {
            chat,
            voice,
            context,
            state: LoopState::Running,
        }
    }

    #[allow(dead_code)]
    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Run until an exit keyword or end of input and return the full context.
    pub async fn run<R: BufRead, W: Write>(
        mut self,
        mut input: R,
        mut out: W,
    ) -> Result<Context, ConversationError> {
        if !self.context.is_empty() {
            debug!("Replaying {} previous turns", self.context.len());
            replay(&self.context, &mut out)?;
        }

        let mut line = String::new();
        while self.state == LoopState::Running {
            write!(out, "{PROMPT}")?;
            out.flush()?;

            line.clear();
            if input.read_line(&mut line)? == 0 {
                info!("End of input");
                writeln!(out)?;
                self.terminate(&mut out)?;
                break;
            }

            if is_exit_command(&line) {
                self.terminate(&mut out)?;
                break;
            }

            self.exchange(line.trim_end_matches(['\r', '\n']), &mut out)
                .await?;
        }

        Ok(self.context)
    }

    async fn exchange<W: Write>(&mut self, question: &str, out: &mut W) -> Result<(), ConversationError> {
        let reply = self
            .chat
            .reply(&self.context.transcript(), question)
            .await?;

        writeln!(out, "AI: {reply}\n")?;
        out.flush()?;
        self.context.push(question, reply.as_str());

        self.voice.say(&reply).await?;
        Ok(())
    }

    fn terminate<W: Write>(&mut self, out: &mut W) -> io::Result<()> {
        writeln!(out, "{FAREWELL}")?;
        out.flush()?;
        info!("State: {} → {}", self.state, LoopState::Terminated);
        self.state = LoopState::Terminated;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::context::Turn;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::sync::Mutex;

    /// Answers with canned replies and records what it was asked.
    pub(crate) struct ScriptedChat {
        replies: Mutex<VecDeque<String>>,
        pub(crate) calls: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedChat {
        pub(crate) fn new(replies: &[&str]) -> Self {
            Self {
                replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedChat {
        async fn reply(&self, context: &str, question: &str) -> Result<String, LlmError> {
            self.calls
                .lock()
                .unwrap()
                .push((context.to_string(), question.to_string()));
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(LlmError::MissingResponse)
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingVoice {
        pub(crate) spoken: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl VoiceOutput for RecordingVoice {
        async fn say(&self, text: &str) -> Result<(), SpeechError> {
            self.spoken.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    struct BrokenVoice;

    #[async_trait]
    impl VoiceOutput for BrokenVoice {
        async fn say(&self, _text: &str) -> Result<(), SpeechError> {
            Err(SpeechError::NoAudio)
        }
    }

    #[test]
    fn exit_keywords_ignore_case_and_whitespace() {
        for input in ["quit", "EXIT\n", "  q ", "Bye\r\n"] {
            assert!(is_exit_command(input), "{input:?}");
        }
        for input in ["", "quit now", "goodbye", "qq"] {
            assert!(!is_exit_command(input), "{input:?}");
        }
    }

    #[test]
    fn replay_prints_turns_without_mutating() {
        let context = Context::from_turns(vec![Turn::new("a", "b"), Turn::new("c", "d")]);
        let before = context.clone();
        let mut out = Vec::new();

        replay(&context, &mut out).unwrap();
        replay(&context, &mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.matches("User: a\nAI: b\n\nUser: c\nAI: d\n\n").count(), 2);
        assert_eq!(context, before);
    }

    #[tokio::test]
    async fn exchange_appends_turn_and_speaks() {
        let chat = ScriptedChat::new(&["hi there", "fine"]);
        let voice = RecordingVoice::default();
        let conversation = Conversation::new(&chat, &voice, Context::new());
        assert_eq!(conversation.state(), LoopState::Running);

        let input = Cursor::new("hello\nhow are you?\nquit\n");
        let mut out = Vec::new();
        let context = conversation.run(input, &mut out).await.unwrap();

        assert_eq!(
            context.turns(),
            &[Turn::new("hello", "hi there"), Turn::new("how are you?", "fine")]
        );
        assert_eq!(*voice.spoken.lock().unwrap(), vec!["hi there", "fine"]);

        let calls = chat.calls.lock().unwrap();
        assert_eq!(calls[0], (String::new(), "hello".to_string()));
        assert_eq!(calls[1].0, "User: hello\nAI: hi there\n");

        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "User: AI: hi there\n\nUser: AI: fine\n\nUser: AI: Goodbye!\n"
        );
    }

    #[tokio::test]
    async fn end_of_input_terminates() {
        let chat = ScriptedChat::new(&["pong"]);
        let voice = RecordingVoice::default();
        let conversation = Conversation::new(&chat, &voice, Context::new());

        let context = conversation
            .run(Cursor::new("ping"), Vec::new())
            .await
            .unwrap();
        assert_eq!(context.turns(), &[Turn::new("ping", "pong")]);
    }

    #[tokio::test]
    async fn loaded_context_is_replayed_and_kept() {
        let chat = ScriptedChat::new(&[]);
        let voice = RecordingVoice::default();
        let loaded = Context::from_turns(vec![Turn::new("a", "b")]);
        let conversation = Conversation::new(&chat, &voice, loaded.clone());

        let mut out = Vec::new();
        let context = conversation
            .run(Cursor::new("bye\n"), &mut out)
            .await
            .unwrap();

        assert_eq!(context, loaded);
        assert!(chat.calls.lock().unwrap().is_empty());
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "User: a\nAI: b\n\nUser: AI: Goodbye!\n"
        );
    }

    #[tokio::test]
    async fn model_failure_propagates() {
        let chat = ScriptedChat::new(&[]);
        let voice = RecordingVoice::default();
        let conversation = Conversation::new(&chat, &voice, Context::new());

        let result = conversation.run(Cursor::new("hello\nquit\n"), Vec::new()).await;
        assert!(matches!(result, Err(ConversationError::Llm(_))));
        assert!(voice.spoken.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn speech_failure_propagates() {
        let chat = ScriptedChat::new(&["hi"]);
        let conversation = Conversation::new(&chat, &BrokenVoice, Context::new());

        let result = conversation.run(Cursor::new("hello\nquit\n"), Vec::new()).await;
        assert!(matches!(
            result,
            Err(ConversationError::Speech(SpeechError::NoAudio))
        ));
    }
}
