//! In-memory process used by unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tokio::sync::{broadcast, watch};

use super::pty::{PtyError, PtyProcess, PtyStatus};

pub(crate) struct FakePty {
    written: Mutex<Vec<u8>>,
    output_tx: broadcast::Sender<Vec<u8>>,
    exit_tx: watch::Sender<Option<PtyStatus>>,
    terminations: AtomicUsize,
    exit_on_terminate: bool,
}

impl FakePty {
    /// A process that exits when terminated, like a real shell.
    pub(crate) fn new() -> Self {
        Self::build(true)
    }

    /// A process that ignores termination requests.
    pub(crate) fn stubborn() -> Self {
        Self::build(false)
    }

    fn build(exit_on_terminate: bool) -> Self {
        let (output_tx, _) = broadcast::channel(64);
        let (exit_tx, _) = watch::channel(None);
        Self {
            written: Mutex::new(Vec::new()),
            output_tx,
            exit_tx,
            terminations: AtomicUsize::new(0),
            exit_on_terminate,
        }
    }

    pub(crate) fn emit(&self, text: &str) {
        let _ = self.output_tx.send(text.as_bytes().to_vec());
    }

    pub(crate) fn exit(&self, code: i32) {
        self.exit_tx.send_replace(Some(PtyStatus::Exited(code)));
    }

    pub(crate) fn written(&self) -> String {
        let written = self.written.lock().unwrap();
        String::from_utf8_lossy(&written).into_owned()
    }

    pub(crate) fn terminate_count(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.output_tx.receiver_count()
    }
}

impl PtyProcess for FakePty {
    fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        self.written.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.output_tx.subscribe()
    }

    fn exit_watch(&self) -> watch::Receiver<Option<PtyStatus>> {
        self.exit_tx.subscribe()
    }

    fn terminate(&self) -> Result<(), PtyError> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        if self.exit_on_terminate {
            self.exit_tx.send_replace(Some(PtyStatus::Terminated));
        }
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        Some(4242)
    }
}
