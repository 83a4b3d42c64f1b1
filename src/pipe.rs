//! Duplex byte channel between a transport implementation and one consumer.
//!
//! A pipe owns no bytes; it routes calls into the transport beneath it and
//! fans the transport's notifications out to the attached consumer. The
//! transport drives the OPENED/CLOSED state transitions by calling the
//! `notify_*` functions from its own task or thread context, never from
//! inside one of its `Transport` methods, which run under the pipe lock.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

use crate::Result;

/// Ceiling on the open and close waits.
const TRANSITION_TIMEOUT: Duration = Duration::from_secs(10);

/// Callbacks a byte transport must provide.
///
/// `transmit` returns the number of bytes accepted (possibly 0); `receive`
/// returns the number of bytes delivered (possibly 0). Completion of open and
/// close is signalled through [`Pipe::notify_opened`] and
/// [`Pipe::notify_closed`]; newly readable data through
/// [`Pipe::notify_receive_ready`].
pub trait Transport: Send {
    fn open(&mut self) -> Result<()>;
    fn transmit(&mut self, buf: &[u8]) -> Result<usize>;
    fn receive(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn close(&mut self) -> Result<()>;
}

/// Event delivered to the attached consumer, exactly one per notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEvent {
    Opened,
    ReceiveReady,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipeState {
    Closed,
    Open,
}

type EventCallback = Box<dyn FnMut(PipeEvent) + Send>;

struct PipeLocked {
    transport: Box<dyn Transport>,
    state: PipeState,
    callback: Option<EventCallback>,
}

struct PipeShared {
    locked: Mutex<PipeLocked>,
    state_changed: Notify,
}

/// Handle to a duplex byte channel. Cheap to clone; all clones share state.
///
/// The event callback is invoked with the pipe lock held, so callback
/// implementations must not call back into the same pipe synchronously and
/// should schedule work instead.
#[derive(Clone)]
pub struct Pipe {
    shared: Arc<PipeShared>,
}

impl Pipe {
    /// Bind a transport. The pipe starts out CLOSED with no callback.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            shared: Arc::new(PipeShared {
                locked: Mutex::new(PipeLocked {
                    transport,
                    state: PipeState::Closed,
                    callback: None,
                }),
                state_changed: Notify::new(),
            }),
        }
    }

    /// Open the pipe, waiting up to 10 s for the transport to report
    /// completion. Returns `Err(Retry)` if the transition does not happen in
    /// time.
    pub async fn open(&self) -> Result<()> {
        let notified = self.shared.state_changed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        {
            let mut locked = self.shared.locked.lock().unwrap();

            locked.transport.open()?;

            if locked.state == PipeState::Open {
                return Ok(());
            }
        }

        let _ = tokio::time::timeout(TRANSITION_TIMEOUT, notified).await;

        let locked = self.shared.locked.lock().unwrap();

        if locked.state == PipeState::Open {
            Ok(())
        } else {
            Err(crate::Error::Retry)
        }
    }

    /// Ask the transport to open without waiting for completion.
    pub fn open_async(&self) -> Result<()> {
        let mut locked = self.shared.locked.lock().unwrap();

        locked.transport.open()
    }

    /// Install the event callback.
    pub fn attach<F>(&self, callback: F)
    where
        F: FnMut(PipeEvent) + Send + 'static,
    {
        let mut locked = self.shared.locked.lock().unwrap();

        locked.callback = Some(Box::new(callback));
    }

    /// Push bytes into the transport. Returns the count actually accepted,
    /// possibly 0. Fails with `PermissionDenied` while the pipe is closed.
    pub fn transmit(&self, buf: &[u8]) -> Result<usize> {
        let mut locked = self.shared.locked.lock().unwrap();

        if locked.state == PipeState::Closed {
            return Err(crate::Error::PermissionDenied);
        }

        locked.transport.transmit(buf)
    }

    /// Pull bytes from the transport. Returns the count delivered; 0 means
    /// nothing available right now. Fails with `PermissionDenied` while the
    /// pipe is closed.
    pub fn receive(&self, buf: &mut [u8]) -> Result<usize> {
        let mut locked = self.shared.locked.lock().unwrap();

        if locked.state == PipeState::Closed {
            return Err(crate::Error::PermissionDenied);
        }

        locked.transport.receive(buf)
    }

    /// Clear the event callback. The transport underneath stays open.
    pub fn release(&self) {
        let mut locked = self.shared.locked.lock().unwrap();

        locked.callback = None;
    }

    /// Close the pipe, waiting up to 10 s for the transport to report
    /// completion. Returns `Err(Retry)` if the transition does not happen in
    /// time.
    pub async fn close(&self) -> Result<()> {
        let notified = self.shared.state_changed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        {
            let mut locked = self.shared.locked.lock().unwrap();

            locked.transport.close()?;

            if locked.state == PipeState::Closed {
                return Ok(());
            }
        }

        let _ = tokio::time::timeout(TRANSITION_TIMEOUT, notified).await;

        let locked = self.shared.locked.lock().unwrap();

        if locked.state == PipeState::Closed {
            Ok(())
        } else {
            Err(crate::Error::Retry)
        }
    }

    /// Ask the transport to close without waiting for completion.
    pub fn close_async(&self) -> Result<()> {
        let mut locked = self.shared.locked.lock().unwrap();

        locked.transport.close()
    }

    /// Transport side: open completed. Updates state, invokes the callback
    /// with `Opened` and wakes any waiter blocked in [`Pipe::open`].
    pub fn notify_opened(&self) {
        let mut locked = self.shared.locked.lock().unwrap();

        locked.state = PipeState::Open;
        debug!("pipe opened");

        if let Some(callback) = locked.callback.as_mut() {
            callback(PipeEvent::Opened);
        }

        self.shared.state_changed.notify_waiters();
    }

    /// Transport side: close completed, or the link went down. Updates state,
    /// invokes the callback with `Closed` and wakes any waiter blocked in
    /// [`Pipe::close`].
    pub fn notify_closed(&self) {
        let mut locked = self.shared.locked.lock().unwrap();

        locked.state = PipeState::Closed;
        debug!("pipe closed");

        if let Some(callback) = locked.callback.as_mut() {
            callback(PipeEvent::Closed);
        }

        self.shared.state_changed.notify_waiters();
    }

    /// Transport side: bytes are waiting. Invokes the callback with
    /// `ReceiveReady`; does not touch state.
    pub fn notify_receive_ready(&self) {
        let mut locked = self.shared.locked.lock().unwrap();

        if let Some(callback) = locked.callback.as_mut() {
            callback(PipeEvent::ReceiveReady);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Transport that accepts everything and echoes a canned receive payload.
    struct ScriptedTransport {
        rx: Vec<u8>,
        tx: Vec<u8>,
    }

    impl Transport for ScriptedTransport {
        fn open(&mut self) -> Result<()> {
            Ok(())
        }

        fn transmit(&mut self, buf: &[u8]) -> Result<usize> {
            self.tx.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn receive(&mut self, buf: &mut [u8]) -> Result<usize> {
            let n = self.rx.len().min(buf.len());
            buf[..n].copy_from_slice(&self.rx[..n]);
            self.rx.drain(..n);
            Ok(n)
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn scripted_pipe() -> Pipe {
        Pipe::new(Box::new(ScriptedTransport {
            rx: Vec::new(),
            tx: Vec::new(),
        }))
    }

    #[tokio::test]
    async fn test_transmit_receive_fail_while_closed() {
        let pipe = scripted_pipe();

        assert!(matches!(
            pipe.transmit(b"AT"),
            Err(crate::Error::PermissionDenied)
        ));

        let mut buf = [0u8; 8];
        assert!(matches!(
            pipe.receive(&mut buf),
            Err(crate::Error::PermissionDenied)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_times_out_without_notification() {
        let pipe = scripted_pipe();

        let result = pipe.open().await;

        assert!(matches!(result, Err(crate::Error::Retry)));
    }

    #[tokio::test]
    async fn test_open_completes_on_notify() {
        let pipe = scripted_pipe();

        let notifier = pipe.clone();
        let opener = tokio::spawn(async move { pipe.open().await });

        tokio::task::yield_now().await;
        notifier.notify_opened();

        assert!(opener.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_open_returns_immediately_when_already_open() {
        let pipe = scripted_pipe();

        pipe.notify_opened();

        assert!(pipe.open().await.is_ok());
        assert_eq!(pipe.transmit(b"AT").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_notify_closed_propagates_and_blocks_io() {
        let pipe = scripted_pipe();
        let events = Arc::new(Mutex::new(Vec::new()));

        let log = events.clone();
        pipe.attach(move |event| log.lock().unwrap().push(event));

        pipe.notify_opened();
        pipe.notify_closed();

        assert_eq!(
            *events.lock().unwrap(),
            vec![PipeEvent::Opened, PipeEvent::Closed]
        );
        assert!(matches!(
            pipe.transmit(b"x"),
            Err(crate::Error::PermissionDenied)
        ));
    }

    #[tokio::test]
    async fn test_release_clears_callback() {
        let pipe = scripted_pipe();
        let hits = Arc::new(AtomicUsize::new(0));

        let counted = hits.clone();
        pipe.attach(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        pipe.notify_receive_ready();
        pipe.release();
        pipe.notify_receive_ready();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
