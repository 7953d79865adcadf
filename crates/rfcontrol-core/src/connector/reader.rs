//! Background reader shared by the stream connectors

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::HandlerSlot;

const READ_CHUNK: usize = 1024;

/// Thread pumping bytes from a stream into a [`HandlerSlot`].
///
/// The stream must have a read timeout so the loop can observe the stop flag.
pub(crate) struct ReaderThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ReaderThread {
    /// Spawn the reader. `connected` is cleared if the stream ends or fails
    /// without being asked to stop.
    pub(crate) fn spawn<R>(
        name: &str,
        mut source: R,
        handlers: HandlerSlot,
        connected: Arc<AtomicBool>,
    ) -> io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let label = name.to_string();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut buf = [0u8; READ_CHUNK];
                while !stop_flag.load(Ordering::Acquire) {
                    match source.read(&mut buf) {
                        Ok(0) => {
                            tracing::info!("{}: stream closed by peer", label);
                            connected.store(false, Ordering::Release);
                            break;
                        }
                        Ok(n) => handlers.deliver(&buf[..n]),
                        Err(e)
                            if matches!(
                                e.kind(),
                                io::ErrorKind::TimedOut
                                    | io::ErrorKind::WouldBlock
                                    | io::ErrorKind::Interrupted
                            ) =>
                        {
                            continue
                        }
                        Err(e) => {
                            if !stop_flag.load(Ordering::Acquire) {
                                tracing::error!("{}: read failed: {}", label, e);
                                connected.store(false, Ordering::Release);
                            }
                            break;
                        }
                    }
                }
                tracing::debug!("{}: reader thread exiting", label);
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Ask the reader to stop and wait for it, unless called from the reader
    /// thread itself (a data handler disconnecting its own connector).
    pub(crate) fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("ReaderThread: reader thread panicked");
            }
        }
    }
}
