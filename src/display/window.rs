//! Viewer window: drives rendering from the winit event loop and maps keys to actions

use std::sync::Arc;

use bytes::Bytes;
use tracing::{error, info, warn};
use winit::application::ApplicationHandler;
use winit::dpi::LogicalSize;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::ActiveEventLoop;
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowId};

use super::gpu::GpuSurface;
use super::overlay::OverlayStyle;
use super::renderer::Renderer;
use crate::capture::{CaptureLoop, CaptureState, Frame};
use crate::pipeline::LatestValueChannel;
use crate::session::{SessionStatus, SignalingSession};
use crate::DisplayConfig;

/// Events injected into the window loop from other threads
#[derive(Debug, Clone, Copy)]
pub enum UiEvent {
    Status(SessionStatus),
}

/// Everything the viewer owns besides the window itself.
pub struct ViewerParts {
    pub config: DisplayConfig,
    pub style: OverlayStyle,
    pub device_index: u32,
    pub frames: flume::Receiver<Frame>,
    pub outbound: Arc<LatestValueChannel<Frame>>,
    pub inbound: Arc<LatestValueChannel<Bytes>>,
    pub capture: CaptureLoop,
    pub session: SignalingSession,
}

pub struct Viewer {
    config: DisplayConfig,
    style: Option<OverlayStyle>,
    device_index: u32,
    frames: flume::Receiver<Frame>,
    outbound: Arc<LatestValueChannel<Frame>>,
    inbound: Arc<LatestValueChannel<Bytes>>,
    capture: CaptureLoop,
    session: SignalingSession,
    renderer: Option<Renderer<GpuSurface>>,
    window: Option<Arc<Window>>,
    status: SessionStatus,
}

impl Viewer {
    pub fn new(parts: ViewerParts) -> Self {
        Self {
            config: parts.config,
            style: Some(parts.style),
            device_index: parts.device_index,
            frames: parts.frames,
            outbound: parts.outbound,
            inbound: parts.inbound,
            capture: parts.capture,
            session: parts.session,
            renderer: None,
            window: None,
            status: SessionStatus::Stopped,
        }
    }

    fn toggle_session(&mut self) {
        if self.session.state().is_active() {
            self.session.close();
            return;
        }
        if self.capture.state() != CaptureState::Running {
            warn!("Camera is closed, detection needs a running capture");
            self.status = SessionStatus::Failed;
            self.update_title();
            return;
        }
        if let Err(e) = self
            .session
            .open(self.outbound.reader(), self.inbound.writer())
        {
            warn!("Cannot open detection session: {}", e);
        }
    }

    /// Close the camera and blank the view, or reopen it.
    fn toggle_camera(&mut self) {
        if self.capture.state() == CaptureState::Running {
            self.capture.close_device();
            self.frames.drain().for_each(drop);
            if let Some(renderer) = self.renderer.as_mut() {
                renderer.clear();
            }
            info!("Camera closed");
        } else if let Err(e) = self.capture.open_device(self.device_index) {
            error!("Failed to reopen camera {}: {}", self.device_index, e);
        }
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        self.session.close();
        self.capture.stop();
        event_loop.exit();
    }

    fn redraw(&mut self) {
        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };
        if let Some(frame) = self.frames.try_iter().last() {
            let latency = frame.timestamp.elapsed();
            metrics::histogram!("frame_latency_ms").record(latency.as_millis() as f64);

            if let Err(e) = renderer.render_frame(&frame) {
                warn!("Frame {} not rendered: {}", frame.meta.sequence, e);
            }
        }
        if let Err(e) = renderer.paint() {
            error!("Display error: {}", e);
        }
    }

    fn on_key(&mut self, event_loop: &ActiveEventLoop, event: KeyEvent) {
        if event.state != ElementState::Pressed || event.repeat {
            return;
        }
        match event.logical_key.as_ref() {
            Key::Named(NamedKey::Escape) => self.shutdown(event_loop),
            Key::Character(c) if c.eq_ignore_ascii_case("d") => self.toggle_session(),
            Key::Character(c) if c.eq_ignore_ascii_case("c") => self.toggle_camera(),
            _ => {}
        }
    }

    fn update_title(&self) {
        if let Some(window) = &self.window {
            window.set_title(&format!("{} | {}", self.config.title, self.status));
        }
    }
}

impl ApplicationHandler<UiEvent> for Viewer {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.renderer.is_some() {
            return;
        }

        let attrs = Window::default_attributes()
            .with_title(format!("{} | {}", self.config.title, self.status))
            .with_inner_size(LogicalSize::new(self.config.width, self.config.height));

        let window = match event_loop.create_window(attrs) {
            Ok(window) => Arc::new(window),
            Err(e) => {
                error!("Failed to create window: {}", e);
                event_loop.exit();
                return;
            }
        };

        let surface = match pollster::block_on(GpuSurface::new(Arc::clone(&window), &self.config)) {
            Ok(surface) => surface,
            Err(e) => {
                error!("Failed to initialize display: {}", e);
                event_loop.exit();
                return;
            }
        };

        let style = self
            .style
            .take()
            .unwrap_or_else(|| OverlayStyle::new("", 3, 20.0));
        self.renderer = Some(Renderer::new(surface, Arc::clone(&self.inbound), style));
        self.window = Some(window);
        info!("Viewer ready: D toggles detection, C toggles the camera, Esc quits");
    }

    fn user_event(&mut self, _event_loop: &ActiveEventLoop, event: UiEvent) {
        match event {
            UiEvent::Status(status) => {
                info!("{}", status);
                self.status = status;
                self.update_title();
            }
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Window close requested");
                self.shutdown(event_loop);
            }
            WindowEvent::RedrawRequested => self.redraw(),
            WindowEvent::Resized(size) => {
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.resize(size.width, size.height);
                }
            }
            WindowEvent::KeyboardInput { event, .. } => self.on_key(event_loop, event),
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.session.close();
        self.capture.stop();
    }
}
