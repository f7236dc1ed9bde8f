use crate::codec::DecodedFrame;
use crate::config::{DisplayConfig, SharedCameraPolicy};
use opencv::highgui;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    mpsc, Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

const KEY_POLL_INTERVAL: Duration = Duration::from_millis(10);
const COMMAND_QUEUE_DEPTH: usize = 32;

#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("Display thread has stopped")]
    Closed,
    #[error("Display is backlogged, dropped frame from {0}")]
    Backlogged(String),
    #[error("Failed to start display thread: {0}")]
    Spawn(std::io::Error),
    #[error("Camera {0} is already displayed by another stream")]
    SurfaceBusy(String),
}

/// Renders decoded frames on a surface keyed by camera id.
pub trait DisplaySink: Send + Sync + 'static {
    fn show(&self, frame: DecodedFrame) -> Result<(), DisplayError>;
    fn close(&self, camera_id: &str);
}

/// Operator-initiated stop. Every active call subscribes when it starts and
/// ends its loop when the interrupt fires.
#[derive(Clone, Debug)]
pub struct OperatorInterrupt {
    tx: broadcast::Sender<()>,
}

impl OperatorInterrupt {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Returns the number of calls that were listening.
    pub fn trigger(&self) -> usize {
        self.tx.send(()).unwrap_or(0)
    }

    pub fn listeners(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for OperatorInterrupt {
    fn default() -> Self {
        Self::new()
    }
}

/// Which calls currently own the surface of each camera id.
#[derive(Debug)]
pub struct SurfaceRegistry {
    policy: SharedCameraPolicy,
    owners: Mutex<HashMap<String, HashSet<u64>>>,
    next_session: AtomicU64,
}

impl SurfaceRegistry {
    pub fn new(policy: SharedCameraPolicy) -> Self {
        Self {
            policy,
            owners: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
        }
    }

    fn next_session_id(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }

    pub fn claim(&self, camera_id: &str, session: u64) -> Result<(), DisplayError> {
        let mut owners = self.owners.lock();
        let entry = owners.entry(camera_id.to_string()).or_default();
        if entry.contains(&session) {
            return Ok(());
        }
        if !entry.is_empty() && self.policy == SharedCameraPolicy::Reject {
            return Err(DisplayError::SurfaceBusy(camera_id.to_string()));
        }
        if !entry.is_empty() {
            tracing::warn!(
                camera_id,
                owners = entry.len() + 1,
                "Camera id is streamed by more than one call, last frame wins"
            );
        }
        entry.insert(session);
        Ok(())
    }

    /// Returns true when no call owns the surface any more.
    pub fn release(&self, camera_id: &str, session: u64) -> bool {
        let mut owners = self.owners.lock();
        let Some(entry) = owners.get_mut(camera_id) else {
            return false;
        };
        entry.remove(&session);
        if entry.is_empty() {
            owners.remove(camera_id);
            return true;
        }
        false
    }

    pub fn owner_count(&self, camera_id: &str) -> usize {
        self.owners.lock().get(camera_id).map_or(0, HashSet::len)
    }
}

/// Everything a call needs to put frames on screen.
pub struct DisplayContext<D: DisplaySink> {
    sink: Arc<D>,
    surfaces: Arc<SurfaceRegistry>,
    interrupt: OperatorInterrupt,
}

impl<D: DisplaySink> Clone for DisplayContext<D> {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
            surfaces: self.surfaces.clone(),
            interrupt: self.interrupt.clone(),
        }
    }
}

impl<D: DisplaySink> DisplayContext<D> {
    pub fn new(sink: D, policy: SharedCameraPolicy, interrupt: OperatorInterrupt) -> Self {
        Self {
            sink: Arc::new(sink),
            surfaces: Arc::new(SurfaceRegistry::new(policy)),
            interrupt,
        }
    }

    pub fn session(&self) -> DisplaySession<D> {
        DisplaySession {
            id: self.surfaces.next_session_id(),
            context: self.clone(),
            claimed: HashSet::new(),
        }
    }

    pub fn interrupt(&self) -> &OperatorInterrupt {
        &self.interrupt
    }

    pub fn surfaces(&self) -> &SurfaceRegistry {
        &self.surfaces
    }
}

/// The surfaces one call has drawn on. Dropping the session releases them and
/// closes every window no other call still owns.
pub struct DisplaySession<D: DisplaySink> {
    id: u64,
    context: DisplayContext<D>,
    claimed: HashSet<String>,
}

impl<D: DisplaySink> DisplaySession<D> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn show(&mut self, frame: DecodedFrame) -> Result<(), DisplayError> {
        if !self.claimed.contains(frame.camera_id()) {
            self.context.surfaces.claim(frame.camera_id(), self.id)?;
            self.claimed.insert(frame.camera_id().to_string());
        }
        self.context.sink.show(frame)
    }

    pub fn close(&mut self) {
        for camera_id in self.claimed.drain() {
            if self.context.surfaces.release(&camera_id, self.id) {
                self.context.sink.close(&camera_id);
            }
        }
    }
}

impl<D: DisplaySink> Drop for DisplaySession<D> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Logs frames instead of drawing them, for hosts without a GUI.
#[derive(Debug, Default, Clone)]
pub struct HeadlessDisplay;

impl DisplaySink for HeadlessDisplay {
    fn show(&self, frame: DecodedFrame) -> Result<(), DisplayError> {
        tracing::debug!(
            camera_id = frame.camera_id(),
            width = frame.width(),
            height = frame.height(),
            "Headless display dropped frame"
        );
        Ok(())
    }

    fn close(&self, camera_id: &str) {
        tracing::debug!(camera_id, "Headless display closed surface");
    }
}

enum DisplayCommand {
    Show(DecodedFrame),
    Close(String),
    Shutdown,
}

/// OpenCV highgui windows, one per camera id, all owned by a single GUI thread.
/// Pressing the quit key fires the operator interrupt and closes every window.
pub struct HighGuiDisplay {
    commands: mpsc::SyncSender<DisplayCommand>,
    worker: Option<JoinHandle<()>>,
}

impl HighGuiDisplay {
    pub fn spawn(
        config: DisplayConfig,
        interrupt: OperatorInterrupt,
    ) -> Result<Self, DisplayError> {
        let (commands, rx) = mpsc::sync_channel(COMMAND_QUEUE_DEPTH);
        let worker = std::thread::Builder::new()
            .name("display".to_string())
            .spawn(move || run_window_loop(rx, config, interrupt))
            .map_err(DisplayError::Spawn)?;
        Ok(Self {
            commands,
            worker: Some(worker),
        })
    }
}

impl DisplaySink for HighGuiDisplay {
    fn show(&self, frame: DecodedFrame) -> Result<(), DisplayError> {
        let camera_id = frame.camera_id().to_string();
        match self.commands.try_send(DisplayCommand::Show(frame)) {
            Ok(()) => Ok(()),
            Err(mpsc::TrySendError::Full(_)) => Err(DisplayError::Backlogged(camera_id)),
            Err(mpsc::TrySendError::Disconnected(_)) => Err(DisplayError::Closed),
        }
    }

    /// Never blocks: this runs on the async call that owns the surface.
    fn close(&self, camera_id: &str) {
        match self
            .commands
            .try_send(DisplayCommand::Close(camera_id.to_string()))
        {
            Ok(()) => {}
            Err(mpsc::TrySendError::Full(_)) => {
                tracing::warn!(camera_id, "Display is backlogged, window left open")
            }
            Err(mpsc::TrySendError::Disconnected(_)) => {
                tracing::debug!(camera_id, "Display thread already stopped")
            }
        }
    }
}

impl Drop for HighGuiDisplay {
    fn drop(&mut self) {
        let _ = self.commands.send(DisplayCommand::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("Display thread panicked");
            }
        }
    }
}

fn run_window_loop(
    rx: mpsc::Receiver<DisplayCommand>,
    config: DisplayConfig,
    interrupt: OperatorInterrupt,
) {
    let mut windows: HashMap<String, String> = HashMap::new();
    let quit_key = config.quit_key as i32;

    loop {
        match rx.recv_timeout(KEY_POLL_INTERVAL) {
            Ok(DisplayCommand::Show(frame)) => {
                let title = windows
                    .entry(frame.camera_id().to_string())
                    .or_insert_with(|| config.window_title(frame.camera_id()));
                if let Err(e) = highgui::imshow(title, &frame.image) {
                    tracing::warn!("Failed to show frame from {}: {:?}", frame.camera_id(), e);
                }
            }
            Ok(DisplayCommand::Close(camera_id)) => {
                if let Some(title) = windows.remove(&camera_id) {
                    if let Err(e) = highgui::destroy_window(&title) {
                        tracing::debug!("Failed to destroy window {}: {:?}", title, e);
                    }
                }
            }
            Ok(DisplayCommand::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }

        if windows.is_empty() {
            continue;
        }

        match highgui::wait_key(1) {
            Ok(key) if key >= 0 && (key & 0xFF) == quit_key => {
                let listeners = interrupt.trigger();
                tracing::info!(listeners, "Quit key pressed, closing all windows");
                destroy_all_windows(&mut windows);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Failed to poll keyboard: {:?}", e),
        }
    }

    destroy_all_windows(&mut windows);
    tracing::info!("Display thread stopped");
}

fn destroy_all_windows(windows: &mut HashMap<String, String>) {
    windows.clear();
    if let Err(e) = highgui::destroy_all_windows() {
        tracing::debug!("Failed to destroy windows: {:?}", e);
    }
}
