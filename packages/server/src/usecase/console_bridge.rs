//! Console bridge: prints inbound messages on its own thread.

use std::{
    io::{self, Write},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{
    domain::{MessageQueue, ShutdownFlag},
    error::RelayError,
};

/// Upper bound on how long an arrival waits before it is printed.
pub const BRIDGE_INTERVAL: Duration = Duration::from_millis(25);

const THREAD_NAME: &str = "console-bridge";

/// Handle to the running bridge thread.
///
/// The bridge keeps draining until the shutdown flag has left `running` and
/// [`ConsoleBridge::finish`] has been called. It then prints whatever is still
/// queued before the thread exits, so no received message is dropped.
pub struct ConsoleBridge {
    handle: JoinHandle<io::Result<usize>>,
    producers_done: Arc<AtomicBool>,
}

impl ConsoleBridge {
    pub fn spawn<W>(
        inbound: Arc<MessageQueue>,
        shutdown: Arc<ShutdownFlag>,
        interval: Duration,
        out: W,
    ) -> io::Result<Self>
    where
        W: Write + Send + 'static,
    {
        let producers_done = Arc::new(AtomicBool::new(false));
        let done = producers_done.clone();
        let handle = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || bridge(&inbound, &shutdown, &done, interval, out))?;

        Ok(Self {
            handle,
            producers_done,
        })
    }

    /// Stop the bridge once nothing can be enqueued anymore.
    ///
    /// Call after the service loop thread has been joined. Returns the number
    /// of messages printed over the bridge's lifetime.
    pub fn finish(self) -> Result<usize, RelayError> {
        self.producers_done.store(true, Ordering::Release);
        match self.handle.join() {
            Ok(Ok(printed)) => Ok(printed),
            Ok(Err(e)) => Err(RelayError::Output(e)),
            Err(_) => Err(RelayError::ThreadPanicked(THREAD_NAME)),
        }
    }
}

fn bridge<W: Write>(
    inbound: &MessageQueue,
    shutdown: &ShutdownFlag,
    producers_done: &AtomicBool,
    interval: Duration,
    mut out: W,
) -> io::Result<usize> {
    tracing::debug!("Console bridge started (interval: {:?})", interval);
    let mut printed = 0;

    loop {
        inbound.wait_for(interval);
        printed += print_pending(inbound, &mut out)?;

        if !shutdown.is_running() && producers_done.load(Ordering::Acquire) {
            printed += print_pending(inbound, &mut out)?;
            break;
        }
    }

    tracing::debug!("Console bridge stopped after {} messages", printed);
    Ok(printed)
}

fn print_pending<W: Write>(inbound: &MessageQueue, out: &mut W) -> io::Result<usize> {
    let messages = inbound.drain_all();
    if messages.is_empty() {
        return Ok(0);
    }
    for message in &messages {
        writeln!(out, "> {}", message)?;
    }
    out.flush()?;
    Ok(messages.len())
}
