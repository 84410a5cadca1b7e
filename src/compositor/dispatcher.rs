//! Repaint & Event Dispatcher
//!
//! Repaints are queued to a compositor thread that owns the framebuffer.
//! For each request it copies the surface region to the screen, re-blits any
//! surfaces stacked above, hands the region to the refresh driver and waits
//! for the panel to finish before reporting the request flushed.
//!
//! Input events go to the input channel of whichever surface holds focus.

use blight_proto::{EventPacket, Message, RawInputEvent, Rect, WaveformMode};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use super::epdc::RefreshDriver;
use super::framebuffer::FrameBuffer;
use super::registry::{RegistryError, SurfaceId, SurfaceRegistry};
use crate::channel::Channel;

/// How many flushed markers are remembered for late waiters
const COMPLETED_MARKERS: usize = 64;

const WHITE: [u8; 3] = [0xff; 3];

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("compositor is not running")]
    Stopped,
}

/// Lifecycle of one repaint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepaintState {
    Requested,
    Queued,
    Compositing,
    Flushed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    /// Region in surface coordinates
    Surface(SurfaceId),
    /// Region in screen coordinates, redrawn from every surface
    Screen,
}

struct RepaintRequest {
    target: Target,
    area: Rect,
    waveform: WaveformMode,
    marker: u32,
    state: RepaintState,
    done: oneshot::Sender<()>,
}

impl RepaintRequest {
    fn advance(&mut self, state: RepaintState) {
        trace!("Repaint {:?} marker {}: {:?} -> {:?}", self.target, self.marker, self.state, state);
        self.state = state;
    }
}

#[derive(Default)]
struct Markers {
    waiters: HashMap<u32, Vec<oneshot::Sender<()>>>,
    completed: VecDeque<u32>,
}

/// Completion notifications for client markers.
///
/// Every waiter registered for a marker is woken exactly once, when the next
/// repaint carrying that marker is flushed. Waiting on a marker flushed a
/// moment ago returns at once.
#[derive(Default)]
pub struct MarkerBoard {
    inner: Mutex<Markers>,
}

impl MarkerBoard {
    fn lock(&self) -> std::sync::MutexGuard<'_, Markers> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A repaint with `marker` was queued; earlier completions no longer count
    pub fn begin(&self, marker: u32) {
        self.lock().completed.retain(|&m| m != marker);
    }

    pub fn complete(&self, marker: u32) {
        let mut markers = self.lock();
        for waiter in markers.waiters.remove(&marker).unwrap_or_default() {
            let _ = waiter.send(());
        }
        markers.completed.retain(|&m| m != marker);
        if markers.completed.len() == COMPLETED_MARKERS {
            markers.completed.pop_front();
        }
        markers.completed.push_back(marker);
    }

    pub async fn wait(&self, marker: u32) {
        let rx = {
            let mut markers = self.lock();
            if markers.completed.contains(&marker) {
                return;
            }
            // Waiters that gave up (a cancelled call) leave closed senders
            markers.waiters.retain(|_, waiting| {
                waiting.retain(|tx| !tx.is_closed());
                !waiting.is_empty()
            });
            let (tx, rx) = oneshot::channel();
            markers.waiters.entry(marker).or_default().push(tx);
            rx
        };
        let _ = rx.await;
    }

    #[cfg(test)]
    fn waiting(&self) -> usize {
        self.lock().waiters.values().map(Vec::len).sum()
    }
}

/// Surface holding input focus and where its events go
#[derive(Clone)]
pub struct FocusTarget {
    pub surface: SurfaceId,
    pub owner: i32,
    pub input: Arc<Channel>,
}

pub struct Dispatcher {
    registry: Arc<Mutex<SurfaceRegistry>>,
    queue: mpsc::UnboundedSender<RepaintRequest>,
    markers: Arc<MarkerBoard>,
    focus: Mutex<Option<FocusTarget>>,
}

impl Dispatcher {
    /// Start the compositor thread. The screen is cleared before the first
    /// queued repaint is processed.
    pub fn start(
        registry: Arc<Mutex<SurfaceRegistry>>,
        framebuffer: FrameBuffer,
        driver: Arc<dyn RefreshDriver>,
    ) -> std::io::Result<Arc<Self>> {
        let (queue, rx) = mpsc::unbounded_channel();
        let markers = Arc::new(MarkerBoard::default());
        let compositor = Compositor {
            framebuffer,
            driver,
            registry: registry.clone(),
            markers: markers.clone(),
            hardware_marker: 0,
        };
        std::thread::Builder::new()
            .name("compositor".into())
            .spawn(move || compositor.run(rx))?;
        Ok(Arc::new(Self {
            registry,
            queue,
            markers,
            focus: Mutex::new(None),
        }))
    }

    pub fn registry(&self) -> &Arc<Mutex<SurfaceRegistry>> {
        &self.registry
    }

    fn enqueue(
        &self,
        target: Target,
        area: Rect,
        waveform: WaveformMode,
        marker: u32,
    ) -> Result<oneshot::Receiver<()>, DispatchError> {
        let (done, rx) = oneshot::channel();
        let mut request = RepaintRequest {
            target,
            area,
            waveform,
            marker,
            state: RepaintState::Requested,
            done,
        };
        if marker != 0 {
            self.markers.begin(marker);
        }
        request.advance(RepaintState::Queued);
        self.queue.send(request).map_err(|_| DispatchError::Stopped)?;
        Ok(rx)
    }

    /// Queue a repaint of `area` (surface coordinates) of a surface.
    ///
    /// The receiver completes once the refresh has physically finished.
    /// Areas outside the buffer are clipped when compositing.
    pub fn repaint(
        &self,
        surface: SurfaceId,
        area: Rect,
        waveform: WaveformMode,
        marker: u32,
    ) -> Result<oneshot::Receiver<()>, DispatchError> {
        if lock(&self.registry).get(surface).is_none() {
            return Err(RegistryError::UnknownSurface(surface).into());
        }
        self.enqueue(Target::Surface(surface), area, waveform, marker)
    }

    /// Redraw a screen region from all surfaces, e.g. after one went away
    pub fn repaint_screen(
        &self,
        area: Rect,
        waveform: WaveformMode,
    ) -> Result<oneshot::Receiver<()>, DispatchError> {
        self.enqueue(Target::Screen, area, waveform, 0)
    }

    /// Wait until a repaint carrying `marker` has been flushed
    pub async fn wait_for_marker(&self, marker: u32) {
        self.markers.wait(marker).await;
    }

    /// Change a surface's offset. Nothing is redrawn until the next repaint.
    pub fn move_surface(&self, surface: SurfaceId, x: i32, y: i32) -> Result<Rect, DispatchError> {
        Ok(lock(&self.registry).move_surface(surface, x, y)?)
    }

    pub fn set_focus(&self, target: Option<FocusTarget>) {
        match &target {
            Some(target) => info!("Focus moved to surface {}", target.surface),
            None => debug!("Focus cleared"),
        }
        *lock(&self.focus) = target;
    }

    pub fn focused(&self) -> Option<FocusTarget> {
        lock(&self.focus).clone()
    }

    /// Send an event to the focused surface's client. Returns false when the
    /// event was dropped: nothing focused, the channel is disabled or full.
    pub fn dispatch_event(&self, device_id: u32, event: RawInputEvent) -> bool {
        let Some(target) = self.focused() else {
            trace!("No focus, dropping event {:?}", event);
            return false;
        };
        let bytes = Message::from_payload(0, &EventPacket { device_id, event }).encode();
        let written = target.input.write(&bytes);
        if written != 0 && written != bytes.len() {
            warn!("Partial event write to {} ({} bytes)", target.owner, written);
        }
        written == bytes.len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the framebuffer; runs on its own thread
struct Compositor {
    framebuffer: FrameBuffer,
    driver: Arc<dyn RefreshDriver>,
    registry: Arc<Mutex<SurfaceRegistry>>,
    markers: Arc<MarkerBoard>,
    hardware_marker: u32,
}

impl Compositor {
    fn run(mut self, mut rx: mpsc::UnboundedReceiver<RepaintRequest>) {
        info!("Compositor thread started");
        self.clear();
        while let Some(request) = rx.blocking_recv() {
            self.process(request);
        }
        info!("Compositor thread stopped");
    }

    fn next_hardware_marker(&mut self) -> u32 {
        self.hardware_marker = self.hardware_marker.wrapping_add(1).max(1);
        self.hardware_marker
    }

    /// White screen, full refresh through the initialize waveform
    fn clear(&mut self) {
        let screen = self.framebuffer.rect();
        self.framebuffer.fill(screen, WHITE);
        self.flush(screen, WaveformMode::Initialize);
    }

    fn flush(&mut self, area: Rect, waveform: WaveformMode) {
        let full = waveform.is_full() || area == self.framebuffer.rect();
        let marker = self.next_hardware_marker();
        let result = self
            .driver
            .send_update(area, waveform, full, marker)
            .and_then(|_| self.driver.wait_for_update(marker));
        if let Err(e) = result {
            error!("Refresh of {:?} failed: {}", area, e);
        }
    }

    /// Draw a request into the framebuffer; returns the screen area touched
    fn composite(&mut self, target: Target, area: Rect) -> Rect {
        let registry = lock(&self.registry);
        let screen = self.framebuffer.rect();
        match target {
            Target::Surface(id) => {
                let Some(surface) = registry.get(id) else {
                    warn!("Surface {} went away before repaint", id);
                    return Rect::default();
                };
                let rect = area
                    .translated(surface.buffer.x, surface.buffer.y)
                    .intersect(&surface.rect())
                    .intersect(&screen);
                if rect.is_empty() {
                    warn!("Repaint {:?} of {} is off screen", area, surface.name());
                    return rect;
                }
                self.framebuffer.blit(&surface.buffer, rect);
                for above in registry.above(id) {
                    if above.rect().intersects(&rect) {
                        self.framebuffer.blit(&above.buffer, rect);
                    }
                }
                rect
            }
            Target::Screen => {
                let rect = area.intersect(&screen);
                if rect.is_empty() {
                    return rect;
                }
                self.framebuffer.fill(rect, WHITE);
                for id in registry.ids() {
                    if let Some(surface) = registry.get(id) {
                        self.framebuffer.blit(&surface.buffer, rect);
                    }
                }
                rect
            }
        }
    }

    fn process(&mut self, mut request: RepaintRequest) {
        request.advance(RepaintState::Compositing);
        let rect = self.composite(request.target, request.area);
        if !rect.is_empty() {
            debug!("Repainting {:?} with {:?}", rect, request.waveform);
            self.flush(rect, request.waveform);
        }
        request.advance(RepaintState::Flushed);
        if request.marker != 0 {
            self.markers.complete(request.marker);
        }
        let _ = request.done.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blight_proto::{PixelFormat, create_buffer};
    use std::io;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        updates: Mutex<Vec<(Rect, WaveformMode, bool)>>,
    }

    impl RefreshDriver for Recorder {
        fn send_update(
            &self,
            area: Rect,
            waveform: WaveformMode,
            full: bool,
            _marker: u32,
        ) -> io::Result<()> {
            self.updates.lock().unwrap().push((area, waveform, full));
            Ok(())
        }

        fn wait_for_update(&self, _marker: u32) -> io::Result<()> {
            Ok(())
        }
    }

    fn compositor(driver: Arc<Recorder>) -> (Compositor, Arc<Mutex<SurfaceRegistry>>) {
        let registry = Arc::new(Mutex::new(SurfaceRegistry::new()));
        let compositor = Compositor {
            framebuffer: FrameBuffer::headless(16, 16, 16, PixelFormat::Grayscale8).unwrap(),
            driver,
            registry: registry.clone(),
            markers: Arc::new(MarkerBoard::default()),
            hardware_marker: 0,
        };
        (compositor, registry)
    }

    fn request(target: Target, area: Rect, marker: u32) -> (RepaintRequest, oneshot::Receiver<()>) {
        let (done, rx) = oneshot::channel();
        let request = RepaintRequest {
            target,
            area,
            waveform: WaveformMode::Mono,
            marker,
            state: RepaintState::Queued,
            done,
        };
        (request, rx)
    }

    fn filled(x: i32, y: i32, size: i32, value: u8) -> blight_proto::Buffer {
        let mut buffer = create_buffer(x, y, size, size, size, PixelFormat::Grayscale8).unwrap();
        buffer.data_mut().fill(value);
        buffer
    }

    #[test]
    fn test_clear_is_white_initialize() {
        let driver = Arc::new(Recorder::default());
        let (mut compositor, _) = compositor(driver.clone());
        compositor.clear();
        assert_eq!(compositor.framebuffer.pixel(3, 3), Some(WHITE));
        let updates = driver.updates.lock().unwrap();
        assert_eq!(updates[0], (Rect::new(0, 0, 16, 16), WaveformMode::Initialize, true));
    }

    #[test]
    fn test_repaint_translates_and_clips() {
        let driver = Arc::new(Recorder::default());
        let (mut compositor, registry) = compositor(driver.clone());
        let id = registry.lock().unwrap().add_surface(1, filled(4, 4, 4, 0x40));
        let (req, mut rx) = request(Target::Surface(id), Rect::new(2, 2, 10, 10), 0);
        compositor.process(req);
        assert!(rx.try_recv().is_ok());
        assert_eq!(compositor.framebuffer.pixel(6, 6), Some([0x40; 3]));
        assert_eq!(compositor.framebuffer.pixel(5, 5), Some([0; 3]));
        let updates = driver.updates.lock().unwrap();
        assert_eq!(updates[0], (Rect::new(6, 6, 2, 2), WaveformMode::Mono, false));
    }

    #[test]
    fn test_higher_surfaces_stay_on_top() {
        let driver = Arc::new(Recorder::default());
        let (mut compositor, registry) = compositor(driver);
        let (low, _high) = {
            let mut registry = registry.lock().unwrap();
            let low = registry.add_surface(1, filled(0, 0, 8, 0x10));
            let high = registry.add_surface(2, filled(4, 4, 8, 0x90));
            (low, high)
        };
        let (req, _rx) = request(Target::Surface(low), Rect::new(0, 0, 8, 8), 0);
        compositor.process(req);
        assert_eq!(compositor.framebuffer.pixel(1, 1), Some([0x10; 3]));
        assert_eq!(compositor.framebuffer.pixel(5, 5), Some([0x90; 3]));
    }

    #[test]
    fn test_screen_repaint_fills_uncovered_area() {
        let driver = Arc::new(Recorder::default());
        let (mut compositor, registry) = compositor(driver);
        registry.lock().unwrap().add_surface(1, filled(0, 0, 4, 0x20));
        let (req, _rx) = request(Target::Screen, Rect::new(0, 0, 8, 8), 0);
        compositor.process(req);
        assert_eq!(compositor.framebuffer.pixel(1, 1), Some([0x20; 3]));
        assert_eq!(compositor.framebuffer.pixel(6, 6), Some(WHITE));
    }

    #[test]
    fn test_removed_surface_still_completes() {
        let driver = Arc::new(Recorder::default());
        let (mut compositor, _registry) = compositor(driver.clone());
        let (req, mut rx) = request(Target::Surface(SurfaceId(9)), Rect::new(0, 0, 4, 4), 3);
        compositor.process(req);
        assert!(rx.try_recv().is_ok());
        assert!(driver.updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_marker_waiters_woken_once_for_their_marker() {
        let board = Arc::new(MarkerBoard::default());
        board.begin(5);
        let a = tokio::spawn({
            let board = board.clone();
            async move { board.wait(5).await }
        });
        let b = tokio::spawn({
            let board = board.clone();
            async move { board.wait(5).await }
        });
        tokio::task::yield_now().await;
        board.complete(6);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!a.is_finished());
        assert!(!b.is_finished());
        board.complete(5);
        a.await.unwrap();
        b.await.unwrap();
        // Already flushed
        board.wait(5).await;
        board.begin(5);
        assert!(tokio::time::timeout(Duration::from_millis(20), board.wait(5))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_abandoned_waiters_are_pruned() {
        let board = MarkerBoard::default();
        for marker in 1..=50 {
            assert!(tokio::time::timeout(Duration::from_millis(1), board.wait(marker))
                .await
                .is_err());
        }
        assert_eq!(board.waiting(), 1);

        let board = Arc::new(board);
        let live = tokio::spawn({
            let board = board.clone();
            async move { board.wait(7).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(tokio::time::timeout(Duration::from_millis(1), board.wait(8))
            .await
            .is_err());
        assert_eq!(board.waiting(), 2);
        board.complete(7);
        live.await.unwrap();
        assert_eq!(board.waiting(), 1);
    }

    #[tokio::test]
    async fn test_repaint_then_wait_for_marker() {
        let registry = Arc::new(Mutex::new(SurfaceRegistry::new()));
        let framebuffer = FrameBuffer::headless(16, 16, 16, PixelFormat::Grayscale8).unwrap();
        let dispatcher =
            Dispatcher::start(registry.clone(), framebuffer, Arc::new(super::super::epdc::Headless))
                .unwrap();
        let id = registry.lock().unwrap().add_surface(1, filled(0, 0, 10, 0));
        let done = dispatcher
            .repaint(id, Rect::new(0, 0, 10, 10), WaveformMode::Mono, 5)
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), dispatcher.wait_for_marker(5))
            .await
            .unwrap();
        done.await.unwrap();

        registry.lock().unwrap().remove_surface(id).unwrap();
        assert!(matches!(
            dispatcher.repaint(id, Rect::new(0, 0, 1, 1), WaveformMode::Mono, 1),
            Err(DispatchError::Registry(RegistryError::UnknownSurface(_)))
        ));
    }

    #[tokio::test]
    async fn test_events_go_to_focus_only() {
        let registry = Arc::new(Mutex::new(SurfaceRegistry::new()));
        let framebuffer = FrameBuffer::headless(4, 4, 4, PixelFormat::Grayscale8).unwrap();
        let dispatcher =
            Dispatcher::start(registry, framebuffer, Arc::new(super::super::epdc::Headless))
                .unwrap();
        let event = RawInputEvent {
            kind: 1,
            code: 330,
            value: 1,
        };
        assert!(!dispatcher.dispatch_event(0, event));

        let mut channel = Channel::new(false);
        let remote = channel.take_remote().unwrap();
        let input = Arc::new(channel);
        dispatcher.set_focus(Some(FocusTarget {
            surface: SurfaceId(1),
            owner: 1,
            input: input.clone(),
        }));
        assert!(dispatcher.dispatch_event(2, event));
        let mut reader = blight_proto::socket::MessageReader::new();
        let message = reader
            .read_blocking(std::os::fd::AsFd::as_fd(&remote), Some(Duration::from_secs(1)))
            .unwrap();
        let packet: EventPacket = blight_proto::wire::cast(Some(&message)).unwrap();
        assert_eq!(packet.device_id, 2);
        assert_eq!(packet.event, event);

        input.set_enabled(false);
        assert!(!dispatcher.dispatch_event(2, event));
        dispatcher.set_focus(None);
        assert!(!dispatcher.dispatch_event(2, event));
    }
}
