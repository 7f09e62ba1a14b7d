// Link Core
// State, discovery set, telemetry and read-loop bookkeeping shared by every link

use crate::device::traits::dedup_by_address;
use crate::device::{DeviceDescriptor, LinkState, SensorFrame, TransportKind};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub(crate) struct LinkCore {
    kind: TransportKind,
    state: watch::Sender<LinkState>,
    telemetry: watch::Sender<Option<SensorFrame>>,
    discovered: Mutex<Vec<DeviceDescriptor>>,
    device: Mutex<Option<DeviceDescriptor>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl LinkCore {
    pub(crate) fn new(kind: TransportKind) -> Arc<Self> {
        let (state, _) = watch::channel(LinkState::Disconnected);
        let (telemetry, _) = watch::channel(None);
        Arc::new(Self {
            kind,
            state,
            telemetry,
            discovered: Mutex::new(Vec::new()),
            device: Mutex::new(None),
            reader: Mutex::new(None),
        })
    }

    pub(crate) fn kind(&self) -> TransportKind {
        self.kind
    }

    pub(crate) fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    pub(crate) fn telemetry(&self) -> watch::Receiver<Option<SensorFrame>> {
        self.telemetry.subscribe()
    }

    pub(crate) fn set_state(&self, next: LinkState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if !current.can_transition_to(&next) {
                debug!(link = %self.kind, from = ?current, to = ?next, "unexpected link transition");
            }
            *current = next;
            true
        });
    }

    // ------------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------------

    pub(crate) fn clear_discovered(&self) {
        lock(&self.discovered).clear();
    }

    pub(crate) fn record_discovered(&self, found: Vec<DeviceDescriptor>) -> Vec<DeviceDescriptor> {
        let unique = dedup_by_address(found);
        *lock(&self.discovered) = unique.clone();
        debug!(link = %self.kind, count = unique.len(), "discovery finished");
        unique
    }

    pub(crate) fn discovered(&self) -> Vec<DeviceDescriptor> {
        lock(&self.discovered).clone()
    }

    // ------------------------------------------------------------------------
    // Connection bookkeeping
    // ------------------------------------------------------------------------

    pub(crate) fn begin_connect(&self) -> Result<(), crate::device::LinkError> {
        if self.state() == LinkState::Connecting {
            return Err(crate::device::LinkError::ConnectionFailed(
                "connect already in progress".to_string(),
            ));
        }
        self.stop_reader();
        self.set_state(LinkState::Connecting);
        Ok(())
    }

    pub(crate) fn mark_connected(&self, device: &DeviceDescriptor) {
        let mut device = device.clone();
        device.connected = true;
        for seen in lock(&self.discovered).iter_mut() {
            seen.connected = seen.address == device.address;
        }
        info!(link = %self.kind, device = %device.display_name(), "device connected");
        *lock(&self.device) = Some(device);
        self.set_state(self.kind.connected_state());
    }

    pub(crate) fn mark_failed(&self) {
        *lock(&self.device) = None;
        self.set_state(LinkState::Error);
    }

    pub(crate) fn mark_disconnected(&self) {
        self.stop_reader();
        if let Some(device) = lock(&self.device).take() {
            info!(link = %self.kind, device = %device.display_name(), "device disconnected");
        }
        for seen in lock(&self.discovered).iter_mut() {
            seen.connected = false;
        }
        self.set_state(LinkState::Disconnected);
    }

    pub(crate) fn connected_device(&self) -> Option<DeviceDescriptor> {
        lock(&self.device).clone()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    // ------------------------------------------------------------------------
    // Telemetry read loops
    // ------------------------------------------------------------------------

    fn publish_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let frame = SensorFrame::parse(line);
        debug!(link = %self.kind, impact = frame.impact_force, "telemetry frame");
        self.telemetry.send_replace(Some(frame));
    }

    fn install_reader(&self, handle: JoinHandle<()>) {
        if let Some(previous) = lock(&self.reader).replace(handle) {
            previous.abort();
        }
    }

    fn stop_reader(&self) {
        if let Some(handle) = lock(&self.reader).take() {
            handle.abort();
        }
    }

    /// Read newline-framed telemetry until EOF, an I/O error, or the link
    /// leaves `connected`. Bytes are decoded lossily. A line longer than
    /// `max_line` is discarded up to its terminating newline.
    pub(crate) fn spawn_line_reader<R>(
        self: &Arc<Self>,
        reader: R,
        connected: LinkState,
        max_line: usize,
    ) where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let core = Arc::downgrade(self);
        let limit = max_line.max(1) as u64 + 1;
        let handle = tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            let mut discarding = false;
            loop {
                let Some(link) = core.upgrade() else { break };
                if link.state() != connected {
                    break;
                }
                drop(link);

                buf.clear();
                let result = AsyncReadExt::take(&mut reader, limit)
                    .read_until(b'\n', &mut buf)
                    .await;

                let Some(link) = core.upgrade() else { break };
                match result {
                    Ok(0) => {
                        warn!(link = %link.kind, "device closed the stream");
                        link.end_read_loop(connected);
                        break;
                    }
                    Ok(_) => {
                        let terminated = buf.last() == Some(&b'\n');
                        if discarding {
                            discarding = !terminated;
                        } else if !terminated && buf.len() as u64 >= limit {
                            warn!(link = %link.kind, max_line, "telemetry line too long, discarding");
                            discarding = true;
                        } else {
                            link.publish_line(&String::from_utf8_lossy(&buf));
                        }
                    }
                    Err(e) => {
                        warn!(link = %link.kind, error = %e, "telemetry read failed");
                        link.end_read_loop(connected);
                        break;
                    }
                }
            }
        });
        self.install_reader(handle);
    }

    /// Consume notification payloads until the channel closes, a payload
    /// reports an error, or the link leaves `connected`.
    pub(crate) fn spawn_notification_reader(
        self: &Arc<Self>,
        mut notifications: mpsc::Receiver<Result<Vec<u8>, crate::device::LinkError>>,
        connected: LinkState,
    ) {
        let core = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                let Some(link) = core.upgrade() else { break };
                if link.state() != connected {
                    break;
                }
                drop(link);

                let next = notifications.recv().await;

                let Some(link) = core.upgrade() else { break };
                match next {
                    Some(Ok(bytes)) => {
                        let text = String::from_utf8_lossy(&bytes);
                        for line in text.lines() {
                            link.publish_line(line);
                        }
                    }
                    Some(Err(e)) => {
                        warn!(link = %link.kind, error = %e, "notification stream failed");
                        link.end_read_loop(connected);
                        break;
                    }
                    None => {
                        warn!(link = %link.kind, "notification stream closed");
                        link.end_read_loop(connected);
                        break;
                    }
                }
            }
        });
        self.install_reader(handle);
    }

    fn end_read_loop(&self, connected: LinkState) {
        if self.state() == connected {
            // Called from the reader itself, so release the slot without aborting.
            lock(&self.reader).take();
            *lock(&self.device) = None;
            for seen in lock(&self.discovered).iter_mut() {
                seen.connected = false;
            }
            self.set_state(LinkState::Disconnected);
        }
    }
}

impl Drop for LinkCore {
    fn drop(&mut self) {
        self.stop_reader();
    }
}
