//! Match records, scripts and configuration for the AT chat engine.

use std::sync::Arc;
use std::time::Duration;

/// Callback invoked when a match fires. Receives the parsed arguments:
/// `argv[0]` is the matched literal, later entries are the separator-split
/// arguments. The slices borrow the engine's receive buffer and are only
/// valid for the duration of the call.
pub type MatchCallback = Arc<dyn Fn(&[&[u8]]) + Send + Sync>;

/// Callback invoked exactly once when a script stops.
pub type ScriptCallback = Arc<dyn Fn(ScriptResult) + Send + Sync>;

/// Outcome a stopped script reports to its completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptResult {
    Success,
    Abort,
    Timeout,
}

/// A line pattern the receive parser can recognize.
///
/// The literal is compared byte for byte against a received line; with
/// wildcards enabled a `?` in the literal matches any byte. An empty literal
/// is a catch-all that fires for any line no specific match claimed. Bytes
/// in the separator set split the remainder of a matched line into arguments.
#[derive(Clone)]
pub struct Match {
    pattern: Vec<u8>,
    wildcards: bool,
    separators: Vec<u8>,
    callback: Option<MatchCallback>,
}

impl Match {
    pub fn new(pattern: impl AsRef<[u8]>) -> Self {
        Self {
            pattern: pattern.as_ref().to_vec(),
            wildcards: false,
            separators: Vec::new(),
            callback: None,
        }
    }

    /// A match with an empty literal, firing for any otherwise-unmatched
    /// non-empty line.
    pub fn catch_all() -> Self {
        Self::new([])
    }

    /// Treat `?` in the literal as a single-byte wildcard.
    pub fn with_wildcards(mut self) -> Self {
        self.wildcards = true;
        self
    }

    pub fn with_separators(mut self, separators: impl AsRef<[u8]>) -> Self {
        self.separators = separators.as_ref().to_vec();
        self
    }

    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&[&[u8]]) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub(crate) fn pattern(&self) -> &[u8] {
        &self.pattern
    }

    pub(crate) fn wildcards(&self) -> bool {
        self.wildcards
    }

    pub(crate) fn separators(&self) -> &[u8] {
        &self.separators
    }

    pub(crate) fn callback(&self) -> Option<&MatchCallback> {
        self.callback.as_ref()
    }
}

/// One request/response exchange inside a [`ChatScript`].
///
/// A step with response matches waits for one of them; a step without any is
/// send-only and advances after its timeout (immediately when zero). The
/// request may be empty for a pure wait step.
#[derive(Clone)]
pub struct ScriptStep {
    request: Vec<u8>,
    response_matches: Vec<Match>,
    timeout: Duration,
}

impl ScriptStep {
    pub fn new(request: impl AsRef<[u8]>) -> Self {
        Self {
            request: request.as_ref().to_vec(),
            response_matches: Vec::new(),
            timeout: Duration::ZERO,
        }
    }

    pub fn with_response(mut self, response: Match) -> Self {
        self.response_matches.push(response);
        self
    }

    pub fn with_responses(mut self, responses: impl IntoIterator<Item = Match>) -> Self {
        self.response_matches.extend(responses);
        self
    }

    /// Delay before a send-only step advances to the next one.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub(crate) fn request(&self) -> &[u8] {
        &self.request
    }

    pub(crate) fn response_matches(&self) -> &[Match] {
        &self.response_matches
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// A named sequence of [`ScriptStep`]s with abort matches, an overall timeout
/// and an optional completion callback.
#[derive(Clone)]
pub struct ChatScript {
    name: String,
    steps: Vec<ScriptStep>,
    abort_matches: Vec<Match>,
    callback: Option<ScriptCallback>,
    timeout: Duration,
}

impl ChatScript {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            abort_matches: Vec::new(),
            callback: None,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_step(mut self, step: ScriptStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_steps(mut self, steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        self.steps.extend(steps);
        self
    }

    pub fn with_abort_match(mut self, abort: Match) -> Self {
        self.abort_matches.push(abort);
        self
    }

    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(ScriptResult) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Overall deadline for the whole script.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn steps(&self) -> &[ScriptStep] {
        &self.steps
    }

    pub(crate) fn abort_matches(&self) -> &[Match] {
        &self.abort_matches
    }

    pub(crate) fn callback(&self) -> Option<&ScriptCallback> {
        self.callback.as_ref()
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Configuration consumed by [`super::Chat::new`].
#[derive(Clone)]
pub struct ChatConfig {
    /// Size of the line receive buffer; bounds line length plus the tail copy
    /// of the matched literal.
    pub receive_buf_size: usize,
    /// Upper bound on arguments parsed out of one line.
    pub argv_max: usize,
    /// Line delimiter, transmitted after every request (typically `\r\n`).
    pub delimiter: Vec<u8>,
    /// Bytes silently dropped before parsing (typically NUL).
    pub filter: Vec<u8>,
    /// Matches that stay active outside any script.
    pub unsolicited: Vec<Match>,
    /// Delay between a receive-ready event and draining the pipe, also used
    /// as the retry backoff for partial transmits.
    pub process_delay: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            receive_buf_size: 256,
            argv_max: 16,
            delimiter: b"\r\n".to_vec(),
            filter: vec![0x00],
            unsolicited: Vec::new(),
            process_delay: Duration::from_millis(10),
        }
    }
}

impl ChatConfig {
    pub fn with_unsolicited(mut self, matches: impl IntoIterator<Item = Match>) -> Self {
        self.unsolicited.extend(matches);
        self
    }

    pub fn with_delimiter(mut self, delimiter: impl AsRef<[u8]>) -> Self {
        self.delimiter = delimiter.as_ref().to_vec();
        self
    }

    pub fn with_process_delay(mut self, delay: Duration) -> Self {
        self.process_delay = delay;
        self
    }
}
