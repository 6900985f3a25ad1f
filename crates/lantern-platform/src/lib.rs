// SPDX-License-Identifier: CEPL-1.0
//! Window ownership and input for a renderer-driven main loop.
//!
//! The application owns the loop and pumps winit events between frames
//! instead of handing control to `EventLoop::run_app`.

pub use winit;

use anyhow::{anyhow, Result};
use lantern_math::MoveKeys;
use lantern_render::{DrawableSurface, RenderSize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, MouseButton, WindowEvent};
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::platform::pump_events::{EventLoopExtPumpEvents, PumpStatus};
use winit::window::{Window, WindowAttributes, WindowId};

/// Keyboard and mouse state accumulated between frames.
#[derive(Debug, Default)]
pub struct InputState {
    held: HashSet<KeyCode>,
    dragging: bool,
    cursor: Option<(f64, f64)>,
    drag: (f32, f32),
    quit: bool,
}

impl InputState {
    pub fn key(&mut self, code: KeyCode, pressed: bool) {
        if pressed {
            if code == KeyCode::Escape {
                self.quit = true;
            }
            self.held.insert(code);
        } else {
            self.held.remove(&code);
        }
    }

    pub fn mouse_button(&mut self, button: MouseButton, pressed: bool) {
        if button == MouseButton::Left {
            self.dragging = pressed;
        }
    }

    pub fn cursor_moved(&mut self, x: f64, y: f64) {
        if let Some((px, py)) = self.cursor {
            if self.dragging {
                self.drag.0 += (x - px) as f32;
                self.drag.1 += (y - py) as f32;
            }
        }
        self.cursor = Some((x, y));
    }

    /// Focus loss: nothing stays held.
    pub fn release_all(&mut self) {
        self.held.clear();
        self.dragging = false;
    }

    pub fn is_held(&self, code: KeyCode) -> bool {
        self.held.contains(&code)
    }

    /// WASD moves, arrows look.
    pub fn move_keys(&self) -> MoveKeys {
        const MAP: [(KeyCode, MoveKeys); 8] = [
            (KeyCode::KeyW, MoveKeys::FORWARD),
            (KeyCode::KeyS, MoveKeys::BACK),
            (KeyCode::KeyA, MoveKeys::LEFT),
            (KeyCode::KeyD, MoveKeys::RIGHT),
            (KeyCode::ArrowLeft, MoveKeys::LOOK_LEFT),
            (KeyCode::ArrowRight, MoveKeys::LOOK_RIGHT),
            (KeyCode::ArrowUp, MoveKeys::LOOK_UP),
            (KeyCode::ArrowDown, MoveKeys::LOOK_DOWN),
        ];
        MAP.iter()
            .filter(|(code, _)| self.is_held(*code))
            .fold(MoveKeys::empty(), |acc, (_, k)| acc | *k)
    }

    /// Drag distance in pixels since the last call.
    pub fn take_drag(&mut self) -> (f32, f32) {
        std::mem::take(&mut self.drag)
    }

    pub fn quit_requested(&self) -> bool {
        self.quit
    }
}

struct WindowState {
    attributes: WindowAttributes,
    window: Option<Window>,
    size: RenderSize,
    resized: bool,
    close_requested: bool,
    create_error: Option<String>,
    input: InputState,
}

impl WindowState {
    /// False after a close request or Escape.
    fn is_open(&self) -> bool {
        !self.close_requested && !self.input.quit_requested()
    }
}

impl ApplicationHandler for WindowState {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        match event_loop.create_window(self.attributes.clone()) {
            Ok(window) => {
                let size = window.inner_size();
                self.size = RenderSize {
                    width: size.width,
                    height: size.height,
                };
                info!("window created {}x{}", size.width, size.height);
                self.window = Some(window);
            }
            Err(e) => self.create_error = Some(e.to_string()),
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, id: WindowId, event: WindowEvent) {
        if self.window.as_ref().is_some_and(|w| w.id() != id) {
            return;
        }
        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.close_requested = true;
            }
            WindowEvent::Resized(new_size) => {
                debug!("Resized → {}x{}", new_size.width, new_size.height);
                self.size = RenderSize {
                    width: new_size.width,
                    height: new_size.height,
                };
                self.resized = true;
            }
            WindowEvent::Focused(false) => self.input.release_all(),
            WindowEvent::KeyboardInput { event, .. } => {
                if let PhysicalKey::Code(code) = event.physical_key {
                    self.input
                        .key(code, event.state == ElementState::Pressed);
                }
            }
            WindowEvent::MouseInput { state, button, .. } => {
                self.input
                    .mouse_button(button, state == ElementState::Pressed);
            }
            WindowEvent::CursorMoved { position, .. } => {
                self.input.cursor_moved(position.x, position.y);
            }
            _ => {}
        }
    }
}

/// One window plus the event loop that feeds it.
pub struct WindowHost {
    // window drops before the loop
    state: WindowState,
    event_loop: EventLoop<()>,
}

impl WindowHost {
    /// Create the event loop and pump until the window exists.
    pub fn new(title: &str, width: u32, height: u32) -> Result<Self> {
        let event_loop = EventLoop::new()?;
        let attributes = Window::default_attributes()
            .with_title(title)
            .with_inner_size(PhysicalSize::new(width.max(1), height.max(1)));
        let mut host = WindowHost {
            state: WindowState {
                attributes,
                window: None,
                size: RenderSize { width, height },
                resized: false,
                close_requested: false,
                create_error: None,
                input: InputState::default(),
            },
            event_loop,
        };
        while host.state.window.is_none() {
            if let Some(e) = host.state.create_error.take() {
                return Err(anyhow!("create_window: {e}"));
            }
            if !host.pump_for(Some(Duration::from_millis(10))) {
                return Err(anyhow!("event loop exited before the window was created"));
            }
        }
        // the creation size is not a resize
        host.state.resized = false;
        Ok(host)
    }

    fn pump_for(&mut self, timeout: Option<Duration>) -> bool {
        match self.event_loop.pump_app_events(timeout, &mut self.state) {
            PumpStatus::Continue => self.state.is_open(),
            PumpStatus::Exit(code) => {
                warn!("event loop exited with {code}");
                false
            }
        }
    }

    /// Drain pending events without blocking. False once the window should close.
    pub fn pump(&mut self) -> bool {
        self.pump_for(Some(Duration::ZERO))
    }

    pub fn window(&self) -> Result<&Window> {
        self.state
            .window
            .as_ref()
            .ok_or_else(|| anyhow!("window not created"))
    }

    pub fn input(&self) -> &InputState {
        &self.state.input
    }

    pub fn input_mut(&mut self) -> &mut InputState {
        &mut self.state.input
    }
}

impl DrawableSurface for WindowHost {
    fn drawable_size(&self) -> RenderSize {
        self.state.size
    }

    fn take_resized(&mut self) -> bool {
        std::mem::take(&mut self.state.resized)
    }

    fn wait_events(&mut self) -> bool {
        // blocks until something arrives; Escape counts as closing
        self.pump_for(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wasd_and_arrows_map_to_move_keys() {
        let mut i = InputState::default();
        i.key(KeyCode::KeyW, true);
        i.key(KeyCode::ArrowLeft, true);
        assert_eq!(i.move_keys(), MoveKeys::FORWARD | MoveKeys::LOOK_LEFT);
        i.key(KeyCode::KeyW, false);
        assert_eq!(i.move_keys(), MoveKeys::LOOK_LEFT);
    }

    #[test]
    fn drag_only_counts_with_left_button_held() {
        let mut i = InputState::default();
        i.cursor_moved(10.0, 10.0);
        i.cursor_moved(20.0, 10.0);
        assert_eq!(i.take_drag(), (0.0, 0.0));

        i.mouse_button(MouseButton::Left, true);
        i.cursor_moved(25.0, 4.0);
        i.cursor_moved(30.0, 2.0);
        assert_eq!(i.take_drag(), (10.0, -8.0));
        assert_eq!(i.take_drag(), (0.0, 0.0));
    }

    #[test]
    fn escape_requests_quit_and_focus_loss_releases_keys() {
        let mut i = InputState::default();
        i.key(KeyCode::KeyE, true);
        assert!(i.is_held(KeyCode::KeyE));
        i.release_all();
        assert!(!i.is_held(KeyCode::KeyE));
        assert!(!i.quit_requested());
        i.key(KeyCode::Escape, true);
        assert!(i.quit_requested());
    }

    #[test]
    fn escape_or_close_ends_the_window() {
        let mut state = WindowState {
            attributes: Window::default_attributes(),
            window: None,
            size: RenderSize {
                width: 0,
                height: 0,
            },
            resized: false,
            close_requested: false,
            create_error: None,
            input: InputState::default(),
        };
        assert!(state.is_open());
        state.input.key(KeyCode::Escape, true);
        assert!(!state.is_open());

        state.input = InputState::default();
        state.close_requested = true;
        assert!(!state.is_open());
    }
}
