//! Line-oriented AT command scripting engine.
//!
//! The engine drains bytes from a [`Pipe`] one work-unit at a time, feeds them
//! through a byte-at-a-time parser and dispatches completed lines against
//! three match tables: the running script step's response matches, the
//! script's abort matches, and the permanently installed unsolicited matches.
//! Scripts sequence request/response steps with per-step and overall
//! timeouts; everything that mutates engine state runs on the work queue.

mod types;

pub use types::{ChatConfig, ChatScript, Match, MatchCallback, ScriptCallback, ScriptResult, ScriptStep};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::pipe::{Pipe, PipeEvent};
use crate::sched::{Work, WorkQueue};
use crate::Result;

/// Chunk size for draining the pipe in the process work.
const WORK_BUF_SIZE: usize = 64;

/// Match table lookup order: a line is offered to the running step's response
/// matches first, then the script's abort matches, then the unsolicited set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchKind {
    Response,
    Abort,
    Unsolicited,
}

impl MatchKind {
    const ALL: [MatchKind; 3] = [MatchKind::Response, MatchKind::Abort, MatchKind::Unsolicited];
}

#[derive(Clone)]
struct Works {
    process: Work,
    script_run: Work,
    script_abort: Work,
    script_timeout: Work,
    script_send: Work,
    script_send_timeout: Work,
}

struct ChatInner {
    pipe: Option<Pipe>,

    receive_buf: Vec<u8>,
    receive_len: usize,

    /// Parsed arguments as (offset, length) ranges into `receive_buf`.
    argv: Vec<(usize, usize)>,
    argv_max: usize,

    delimiter: Vec<u8>,
    filter: Vec<u8>,
    unsol_matches: Vec<Match>,
    process_delay: std::time::Duration,

    /// Table and index of the match claimed for the line being parsed.
    parse_match: Option<(MatchKind, usize)>,
    /// Length of the argument accumulating behind the last separator.
    parse_arg_len: usize,

    script: Option<Arc<ChatScript>>,
    step: usize,
    send_request_pos: usize,
    send_delimiter_pos: usize,

    running: Arc<AtomicBool>,
    works: Option<Works>,
}

impl ChatInner {
    fn works(&self) -> &Works {
        self.works.as_ref().expect("works are registered at init")
    }

    fn matches_for(&self, kind: MatchKind) -> &[Match] {
        match kind {
            MatchKind::Response => self
                .script
                .as_ref()
                .filter(|script| self.step < script.steps().len())
                .map(|script| script.steps()[self.step].response_matches())
                .unwrap_or(&[]),
            MatchKind::Abort => self
                .script
                .as_ref()
                .map(|script| script.abort_matches())
                .unwrap_or(&[]),
            MatchKind::Unsolicited => &self.unsol_matches,
        }
    }

    fn parse_reset(&mut self) {
        self.receive_len = 0;
        self.argv.clear();
        self.parse_match = None;
        self.parse_arg_len = 0;
    }

    /// Copy the matched literal to the tail of the receive buffer so the
    /// argument bytes that follow can safely overwrite the head, and record
    /// it as `argv[0]`.
    fn save_match(&mut self) {
        let len = self.receive_len;
        let tail = self.receive_buf.len() - len;

        self.receive_buf.copy_within(0..len, tail);
        self.argv.push((tail, len));
    }

    fn match_matches_received(&self, matched: &Match) -> bool {
        matched
            .pattern()
            .iter()
            .zip(&self.receive_buf[..self.receive_len])
            .all(|(pattern, received)| {
                pattern == received || (matched.wildcards() && *pattern == b'?')
            })
    }

    fn find_match(&self) -> Option<(MatchKind, usize)> {
        for kind in MatchKind::ALL {
            for (index, matched) in self.matches_for(kind).iter().enumerate() {
                if matched.pattern().len() != self.receive_len {
                    continue;
                }

                if self.match_matches_received(matched) {
                    return Some((kind, index));
                }
            }
        }

        None
    }

    fn find_catch_all_match(&self) -> Option<(MatchKind, usize)> {
        for kind in MatchKind::ALL {
            for (index, matched) in self.matches_for(kind).iter().enumerate() {
                if matched.pattern().is_empty() {
                    return Some((kind, index));
                }
            }
        }

        None
    }

    fn is_separator(&self, byte: u8) -> bool {
        let Some((kind, index)) = self.parse_match else {
            return false;
        };

        self.matches_for(kind)
            .get(index)
            .is_some_and(|matched| matched.separators().contains(&byte))
    }

    fn end_del_start(&self) -> bool {
        self.delimiter
            .contains(&self.receive_buf[self.receive_len - 1])
    }

    fn end_del_complete(&self) -> bool {
        if self.receive_len < self.delimiter.len() {
            return false;
        }

        self.receive_buf[self.receive_len - self.delimiter.len()..self.receive_len]
            == self.delimiter[..]
    }

    /// Invoke the claimed match's callback with the parsed argv, then apply
    /// the table's side effect: unsolicited lines leave the script alone,
    /// abort matches stop it, response matches advance it.
    fn on_command_received(&mut self) {
        let Some((kind, index)) = self.parse_match else {
            return;
        };

        let callback = self
            .matches_for(kind)
            .get(index)
            .and_then(|matched| matched.callback().cloned());

        if let Some((offset, len)) = self.argv.first() {
            debug!(
                line = %String::from_utf8_lossy(&self.receive_buf[*offset..offset + len]),
                "matched"
            );
        }

        if let Some(callback) = callback {
            let args: Vec<&[u8]> = self
                .argv
                .iter()
                .map(|&(offset, len)| &self.receive_buf[offset..offset + len])
                .collect();

            callback(&args);
        }

        match kind {
            MatchKind::Unsolicited => {}
            MatchKind::Abort => self.script_stop(ScriptResult::Abort),
            MatchKind::Response => self.script_next(false),
        }
    }

    /// No specific match claimed the line: offer it to a catch-all, with
    /// `argv[0]` empty and `argv[1]` the whole line, delimiter stripped.
    fn on_unknown_command_received(&mut self) {
        let Some(found) = self.find_catch_all_match() else {
            return;
        };

        self.parse_match = Some(found);

        let line_len = self.receive_len - self.delimiter.len();
        self.argv.clear();
        self.argv.push((0, 0));
        self.argv.push((0, line_len));

        self.on_command_received();
    }

    fn process_byte(&mut self, byte: u8) {
        if self.receive_len == self.receive_buf.len() {
            warn!("receive buffer overrun");
            self.parse_reset();

            return;
        }

        if self.argv.len() == self.argv_max {
            warn!("argv table overrun");
            self.parse_reset();

            return;
        }

        self.receive_buf[self.receive_len] = byte;
        self.receive_len += 1;

        if self.end_del_complete() {
            // A line of nothing but the delimiter is dropped silently
            if self.receive_len == self.delimiter.len() {
                self.parse_reset();

                return;
            }

            if self.parse_match.is_none() {
                self.on_unknown_command_received();
                self.parse_reset();

                return;
            }

            if self.parse_arg_len > 0 {
                let start = self.receive_len - self.delimiter.len() - self.parse_arg_len;
                self.argv.push((start, self.parse_arg_len));
            }

            self.on_command_received();
            self.parse_reset();

            return;
        }

        // Hold off while the newest byte could be the delimiter forming
        if self.end_del_start() {
            return;
        }

        if self.parse_match.is_none() {
            let Some(found) = self.find_match() else {
                return;
            };

            self.parse_match = Some(found);
            self.save_match();
            self.parse_arg_len = 0;

            return;
        }

        if self.is_separator(byte) {
            if self.parse_arg_len == 0 {
                self.argv.push((0, 0));
            } else {
                let start = self.receive_len - 1 - self.parse_arg_len;
                self.argv.push((start, self.parse_arg_len));
            }

            self.parse_arg_len = 0;

            return;
        }

        self.parse_arg_len += 1;
    }

    fn script_stop(&mut self, result: ScriptResult) {
        let Some(script) = self.script.clone() else {
            return;
        };

        match result {
            ScriptResult::Success => debug!(script = %script.name(), "complete"),
            ScriptResult::Abort => warn!(script = %script.name(), "aborted"),
            ScriptResult::Timeout => warn!(script = %script.name(), "timed out"),
        }

        // The running flag drops before the completion callback so the
        // callback may start the next script
        self.running.store(false, Ordering::SeqCst);

        if let Some(callback) = script.callback() {
            callback(result);
        }

        self.script = None;
        self.step = 0;

        self.works().script_timeout.cancel();
    }

    fn script_send(&mut self) {
        self.send_request_pos = 0;
        self.send_delimiter_pos = 0;

        self.works().script_send.schedule_now();
    }

    fn script_next(&mut self, initial: bool) {
        if initial {
            self.step = 0;
        } else {
            self.step += 1;
        }

        let Some(script) = self.script.clone() else {
            return;
        };

        if self.step == script.steps().len() {
            self.script_stop(ScriptResult::Success);

            return;
        }

        debug!(script = %script.name(), step = self.step, "advancing");

        if !script.steps()[self.step].request().is_empty() {
            self.script_send();
        }
    }

    fn script_start(&mut self, script: Arc<ChatScript>) {
        debug!(script = %script.name(), "starting");

        let timeout = script.timeout();
        self.script = Some(script);

        self.script_next(true);

        // The first step may already have completed the script
        if self.script.is_some() {
            self.works().script_timeout.schedule_after(timeout);
        }
    }

    /// Push the current step's request through the pipe, resuming from the
    /// last accepted position. Returns true once the whole request is out.
    fn send_request(&mut self, pipe: &Pipe) -> bool {
        let Some(script) = self.script.clone() else {
            return false;
        };

        let request = script.steps()[self.step].request();

        if request.len() == self.send_request_pos {
            return true;
        }

        let sent = match pipe.transmit(&request[self.send_request_pos..]) {
            Ok(sent) => sent,
            Err(_) => 0,
        };

        if sent == 0 {
            return false;
        }

        self.send_request_pos += sent;

        self.send_request_pos == request.len()
    }

    fn send_delimiter(&mut self, pipe: &Pipe) -> bool {
        if self.delimiter.len() == self.send_delimiter_pos {
            return true;
        }

        let sent = match pipe.transmit(&self.delimiter[self.send_delimiter_pos..]) {
            Ok(sent) => sent,
            Err(_) => 0,
        };

        if sent == 0 {
            return false;
        }

        self.send_delimiter_pos += sent;

        self.send_delimiter_pos == self.delimiter.len()
    }
}

/// AT command scripting engine over a [`Pipe`].
pub struct Chat {
    inner: Arc<Mutex<ChatInner>>,
    pending_script: Arc<Mutex<Option<Arc<ChatScript>>>>,
    running: Arc<AtomicBool>,
    works: Works,
}

impl Chat {
    /// Validate the configuration and register the engine's work units with
    /// the queue. The unsolicited matches are installed permanently.
    pub fn new(config: ChatConfig, queue: &WorkQueue) -> Result<Chat> {
        if config.receive_buf_size == 0 {
            return Err(crate::Error::InvalidArgument("receive_buf_size is zero"));
        }

        if config.argv_max == 0 {
            return Err(crate::Error::InvalidArgument("argv_max is zero"));
        }

        if config.delimiter.is_empty() {
            return Err(crate::Error::InvalidArgument("delimiter is empty"));
        }

        let running = Arc::new(AtomicBool::new(false));

        let inner = Arc::new(Mutex::new(ChatInner {
            pipe: None,
            receive_buf: vec![0; config.receive_buf_size],
            receive_len: 0,
            argv: Vec::with_capacity(config.argv_max),
            argv_max: config.argv_max,
            delimiter: config.delimiter,
            filter: config.filter,
            unsol_matches: config.unsolicited,
            process_delay: config.process_delay,
            parse_match: None,
            parse_arg_len: 0,
            script: None,
            step: 0,
            send_request_pos: 0,
            send_delimiter_pos: 0,
            running: running.clone(),
            works: None,
        }));

        let pending_script: Arc<Mutex<Option<Arc<ChatScript>>>> = Arc::new(Mutex::new(None));

        let process = {
            let inner = inner.clone();
            queue.register(move || {
                let mut chat = inner.lock().unwrap();

                let Some(pipe) = chat.pipe.clone() else {
                    return;
                };

                let mut work_buf = [0u8; WORK_BUF_SIZE];

                let received = match pipe.receive(&mut work_buf) {
                    Ok(received) => received,
                    Err(_) => return,
                };

                if received == 0 {
                    return;
                }

                for &byte in &work_buf[..received] {
                    if chat.filter.contains(&byte) {
                        continue;
                    }

                    chat.process_byte(byte);
                }

                // Keep draining until the pipe runs dry
                chat.works().process.schedule_now();
            })
        };

        let script_run = {
            let inner = inner.clone();
            let pending_script = pending_script.clone();
            queue.register(move || {
                let Some(script) = pending_script.lock().unwrap().take() else {
                    return;
                };

                inner.lock().unwrap().script_start(script);
            })
        };

        let script_abort = {
            let inner = inner.clone();
            queue.register(move || {
                let mut chat = inner.lock().unwrap();

                if chat.script.is_none() {
                    return;
                }

                chat.script_stop(ScriptResult::Abort);
            })
        };

        let script_timeout = {
            let inner = inner.clone();
            queue.register(move || {
                let mut chat = inner.lock().unwrap();

                if chat.script.is_none() {
                    return;
                }

                chat.script_stop(ScriptResult::Timeout);
            })
        };

        let script_send = {
            let inner = inner.clone();
            queue.register(move || {
                let mut chat = inner.lock().unwrap();

                if chat.script.is_none() {
                    return;
                }

                let Some(pipe) = chat.pipe.clone() else {
                    return;
                };

                if !chat.send_request(&pipe) {
                    let delay = chat.process_delay;
                    chat.works().script_send.schedule_after(delay);

                    return;
                }

                if !chat.send_delimiter(&pipe) {
                    let delay = chat.process_delay;
                    chat.works().script_send.schedule_after(delay);

                    return;
                }

                // A send-only step advances on its own, immediately or after
                // the step timeout
                let step = chat
                    .script
                    .as_ref()
                    .map(|script| script.steps()[chat.step].clone());

                if let Some(step) = step {
                    if step.response_matches().is_empty() {
                        if step.timeout().is_zero() {
                            chat.script_next(false);
                        } else {
                            chat.works().script_send_timeout.schedule_after(step.timeout());
                        }
                    }
                }
            })
        };

        let script_send_timeout = {
            let inner = inner.clone();
            queue.register(move || {
                let mut chat = inner.lock().unwrap();

                if chat.script.is_none() {
                    return;
                }

                chat.script_next(false);
            })
        };

        let works = Works {
            process,
            script_run,
            script_abort,
            script_timeout,
            script_send,
            script_send_timeout,
        };

        inner.lock().unwrap().works = Some(works.clone());

        Ok(Chat {
            inner,
            pending_script,
            running,
            works,
        })
    }

    /// Bind a pipe, reset the parser and take over the pipe's event callback.
    pub fn attach(&self, pipe: &Pipe) {
        let mut chat = self.inner.lock().unwrap();

        chat.pipe = Some(pipe.clone());
        chat.parse_reset();

        let process = self.works.process.clone();
        let delay = chat.process_delay;

        pipe.attach(move |event| {
            if event == PipeEvent::ReceiveReady {
                process.schedule_after(delay);
            }
        });
    }

    /// Start a script. At most one script runs at a time; the completion
    /// callback is invoked exactly once per successful call.
    pub fn script_run(&self, script: Arc<ChatScript>) -> Result<()> {
        if self.inner.lock().unwrap().pipe.is_none() {
            return Err(crate::Error::PermissionDenied);
        }

        if script.steps().is_empty() {
            return Err(crate::Error::InvalidArgument("script has no steps"));
        }

        for step in script.steps() {
            if step.request().is_empty() && step.response_matches().is_empty() {
                return Err(crate::Error::InvalidArgument(
                    "step needs a request or response matches",
                ));
            }
        }

        if self.running.swap(true, Ordering::SeqCst) {
            return Err(crate::Error::Busy);
        }

        *self.pending_script.lock().unwrap() = Some(script);

        self.works.script_run.schedule_now();

        Ok(())
    }

    /// Request an asynchronous abort of the running script. No-op when idle.
    pub fn script_abort(&self) {
        self.works.script_abort.schedule_now();
    }

    /// Whether a script is currently running.
    pub fn script_is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Release the pipe and synchronously cancel all outstanding work. The
    /// engine can be re-attached afterwards.
    pub async fn release(&self) {
        {
            let chat = self.inner.lock().unwrap();

            if let Some(pipe) = &chat.pipe {
                pipe.release();
            }
        }

        self.works.script_run.cancel_sync().await;
        self.works.script_abort.cancel_sync().await;
        self.works.process.cancel_sync().await;
        self.works.script_send.cancel_sync().await;
        self.works.script_timeout.cancel_sync().await;
        self.works.script_send_timeout.cancel_sync().await;

        let mut chat = self.inner.lock().unwrap();

        chat.pipe = None;
        chat.parse_reset();
        chat.script = None;
        chat.step = 0;
        chat.send_request_pos = 0;
        chat.send_delimiter_pos = 0;

        self.running.store(false, Ordering::SeqCst);
        *self.pending_script.lock().unwrap() = None;
    }
}
