//! Out-of-band data arriving on a remote channel
//!
//! While a remote command runs, every chunk of its output is passed to a [`DataHandler`]. A
//! handler may answer (e.g. an interactive prompt) by returning the text to write to the
//! command's stdin.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Per-channel state kept between calls to a handler.
#[derive(Debug, Default)]
pub struct ChannelState {
    /// host the channel is connected to
    pub host: String,
    pub responses_sent: usize,
    /// free-form storage for handlers
    pub values: HashMap<String, String>,
}

impl ChannelState {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }
}

pub trait DataHandler: Send {
    fn handle_data(&mut self, state: &mut ChannelState, stream: Stream, text: &str)
    -> Option<String>;
}

/// Ignores all output.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl DataHandler for NoopHandler {
    fn handle_data(&mut self, _: &mut ChannelState, _: Stream, _: &str) -> Option<String> {
        None
    }
}

/// Answers prompts matching a regular expression with a fixed response.
///
/// Every rule answers at most `max_responses` times per channel so a rejected answer can't
/// loop forever.
#[derive(Debug, Clone)]
pub struct PromptResponder {
    rules: Vec<(regex::Regex, String)>,
    max_responses: usize,
}

impl PromptResponder {
    pub fn new(max_responses: usize) -> Self {
        Self {
            rules: vec![],
            max_responses,
        }
    }
    pub fn respond_to(mut self, prompt: &str, response: &str) -> anyhow::Result<Self> {
        let regex = regex::Regex::new(prompt)?;
        self.rules.push((regex, response.to_string()));
        Ok(self)
    }
}

impl DataHandler for PromptResponder {
    fn handle_data(
        &mut self,
        state: &mut ChannelState,
        stream: Stream,
        text: &str,
    ) -> Option<String> {
        for (index, (regex, response)) in self.rules.iter().enumerate() {
            if !regex.is_match(text) {
                continue;
            }
            let key = format!("prompt-responder.{}", index);
            let count = state
                .values
                .get(&key)
                .and_then(|value| value.parse::<usize>().ok())
                .unwrap_or(0);
            if count >= self.max_responses {
                tracing::warn!(
                    "{}: prompt {:?} on {:?} repeated, not answering again",
                    state.host,
                    regex.as_str(),
                    stream
                );
                return None;
            }
            state.values.insert(key, (count + 1).to_string());
            return Some(response.clone());
        }
        None
    }
}
