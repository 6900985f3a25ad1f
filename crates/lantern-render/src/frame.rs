// SPDX-License-Identifier: CEPL-1.0
//! Frame lifecycle shared by all backends.
//!
//! One call to [`FrameLoop::step`] renders one frame:
//! wait slot fence -> acquire -> wait image guard -> reset fence ->
//! write uniforms -> record overlay -> submit `[Scene, Overlay]` -> present.
//!
//! Slot count always equals the live swapchain image count. A slot owns the
//! image-available semaphore and the in-flight fence; per-image resources
//! (draw command buffer, render-finished semaphore, uniform region) are only
//! touched after the fence of the slot that last submitted that image has
//! signaled.

use crate::{DrawableSurface, RenderSize, SceneUniforms};
use anyhow::{bail, Result};
use tracing::{debug, info, warn};

/// Bounded acquire wait handed to the backend.
pub const ACQUIRE_TIMEOUT_NS: u64 = 5_000_000_000;

/// Why the swapchain has to be rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceInvalid {
    OutOfDate,
    Resized,
}

/// Result of acquire / present. Fatal failures travel in the `Err` arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainOutcome<T> {
    Ready(T),
    Retry(SurfaceInvalid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquired {
    pub image: usize,
    pub suboptimal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented { image: usize, suboptimal: bool },
    /// Nothing was presented; the swapchain was rebuilt instead.
    Rebuilt(SurfaceInvalid),
    /// The window closed while a rebuild was waiting for a non-zero size.
    Closed,
}

/// Command buffers submitted per frame, in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStream {
    Scene,
    Overlay,
}

/// The scene clears the color attachment, the overlay loads it.
pub const SUBMIT_ORDER: [CommandStream; 2] = [CommandStream::Scene, CommandStream::Overlay];

/// Swapchain-dependent resource groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RebuildStage {
    Pipeline,
    Views,
    Depth,
    Swapchain,
    Overlay,
    DrawCommands,
}

pub const TEARDOWN_ORDER: [RebuildStage; 5] = [
    RebuildStage::Pipeline,
    RebuildStage::Views,
    RebuildStage::Depth,
    RebuildStage::Swapchain,
    RebuildStage::Overlay,
];

pub const BUILD_ORDER: [RebuildStage; 6] = [
    RebuildStage::Swapchain,
    RebuildStage::Views,
    RebuildStage::Depth,
    RebuildStage::Overlay,
    RebuildStage::Pipeline,
    RebuildStage::DrawCommands,
];

/// Where a slot is in its frame. `Submitted` is left behind when present
/// fails; a slot whose image was queued for present stays `Presenting`
/// until its fence is next waited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotState {
    #[default]
    Idle,
    Acquiring,
    RecordingReady,
    Submitted,
    Presenting,
}

/// Device side of the frame loop. Slots index semaphore/fence pairs, images
/// index swapchain images.
pub trait FrameBackend {
    /// Image count of the live swapchain.
    fn image_count(&self) -> usize;

    /// Extent a swapchain built now would get for a `want` sized drawable.
    /// 0x0 while the surface itself has no area.
    fn surface_extent(&mut self, want: RenderSize) -> Result<RenderSize>;

    /// Block until the slot's in-flight fence signals.
    fn wait_slot(&mut self, slot: usize) -> Result<()>;
    fn reset_slot(&mut self, slot: usize) -> Result<()>;

    /// Acquire the next image, signalling the slot's image-available semaphore.
    fn acquire(&mut self, slot: usize) -> Result<SwapchainOutcome<Acquired>>;

    fn write_uniforms(&mut self, image: usize, uniforms: &SceneUniforms) -> Result<()>;
    fn record_overlay(&mut self, image: usize) -> Result<()>;

    /// One queue submission: wait image-available[slot], run `batch` in order,
    /// signal render-finished[image] and fence[slot].
    fn submit(&mut self, slot: usize, image: usize, batch: &[CommandStream]) -> Result<()>;

    /// Present `image` after render-finished[image]. `Ready(true)` means suboptimal.
    fn present(&mut self, image: usize) -> Result<SwapchainOutcome<bool>>;

    fn wait_idle(&mut self) -> Result<()>;

    /// Destroying a stage that is already gone is a no-op.
    fn destroy_stage(&mut self, stage: RebuildStage);
    fn create_stage(&mut self, stage: RebuildStage, size: RenderSize) -> Result<()>;

    /// Make sure exactly `count` slots exist. Existing slots are kept when the count is unchanged.
    fn resize_slots(&mut self, count: usize) -> Result<()>;
}

#[derive(Debug)]
pub struct FrameLoop {
    slots: Vec<SlotState>,
    /// Slot whose fence covers the last submission that used each image.
    guards: Vec<Option<usize>>,
    cursor: usize,
    pending: Option<SurfaceInvalid>,
    suboptimal_seen: bool,
    rebuilds: u64,
}

impl FrameLoop {
    pub fn new(image_count: usize) -> Self {
        Self {
            slots: vec![SlotState::Idle; image_count],
            guards: vec![None; image_count],
            cursor: 0,
            pending: None,
            suboptimal_seen: false,
            rebuilds: 0,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn current_slot(&self) -> usize {
        self.cursor
    }

    pub fn slot_state(&self, slot: usize) -> SlotState {
        self.slots.get(slot).copied().unwrap_or_default()
    }

    pub fn image_guard(&self, image: usize) -> Option<usize> {
        self.guards.get(image).copied().flatten()
    }

    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds
    }

    /// Rebuild at the top of the next step.
    pub fn request_rebuild(&mut self) {
        self.pending = Some(SurfaceInvalid::Resized);
    }

    pub fn step<B, S>(
        &mut self,
        backend: &mut B,
        surface: &mut S,
        uniforms: &SceneUniforms,
    ) -> Result<FrameOutcome>
    where
        B: FrameBackend + ?Sized,
        S: DrawableSurface + ?Sized,
    {
        let resized = surface.take_resized();
        if let Some(reason) = self
            .pending
            .take()
            .or(resized.then_some(SurfaceInvalid::Resized))
        {
            return self.rebuild_outcome(backend, surface, reason);
        }
        if self.slots.is_empty() {
            bail!("frame loop has no slots");
        }

        let slot = self.cursor;
        backend.wait_slot(slot)?;
        self.slots[slot] = SlotState::Acquiring;

        let acquired = match backend.acquire(slot)? {
            SwapchainOutcome::Ready(a) => a,
            SwapchainOutcome::Retry(reason) => {
                // fence still signaled: nothing was reset
                self.slots[slot] = SlotState::Idle;
                return self.rebuild_outcome(backend, surface, reason);
            }
        };
        let image = acquired.image;
        if image >= self.guards.len() {
            bail!(
                "acquired image {image} but the swapchain has {} images",
                self.guards.len()
            );
        }

        if let Some(owner) = self.guards[image] {
            if owner != slot {
                debug!("image {image} guarded by slot {owner}, waiting (slot {slot})");
                backend.wait_slot(owner)?;
            }
        }
        self.guards[image] = Some(slot);

        backend.reset_slot(slot)?;
        self.slots[slot] = SlotState::RecordingReady;

        backend.write_uniforms(image, uniforms)?;
        backend.record_overlay(image)?;
        backend.submit(slot, image, &SUBMIT_ORDER)?;
        self.slots[slot] = SlotState::Submitted;

        let presented = backend.present(image)?;
        self.slots[slot] = SlotState::Presenting;
        self.cursor = (slot + 1) % self.slots.len();

        let suboptimal = match presented {
            SwapchainOutcome::Ready(s) => s || acquired.suboptimal,
            SwapchainOutcome::Retry(reason) => {
                return self.rebuild_outcome(backend, surface, reason)
            }
        };
        if suboptimal && !self.suboptimal_seen {
            warn!("swapchain is suboptimal for the surface; keeping it until out of date");
            self.suboptimal_seen = true;
        }
        Ok(FrameOutcome::Presented { image, suboptimal })
    }

    fn rebuild_outcome<B, S>(
        &mut self,
        backend: &mut B,
        surface: &mut S,
        reason: SurfaceInvalid,
    ) -> Result<FrameOutcome>
    where
        B: FrameBackend + ?Sized,
        S: DrawableSurface + ?Sized,
    {
        if self.rebuild(backend, surface, reason)? {
            Ok(FrameOutcome::Rebuilt(reason))
        } else {
            Ok(FrameOutcome::Closed)
        }
    }

    /// Tear down and recreate every swapchain-dependent stage.
    /// Returns false, with nothing torn down, if the window closed while the
    /// drawable or the surface was 0x0.
    pub fn rebuild<B, S>(
        &mut self,
        backend: &mut B,
        surface: &mut S,
        reason: SurfaceInvalid,
    ) -> Result<bool>
    where
        B: FrameBackend + ?Sized,
        S: DrawableSurface + ?Sized,
    {
        let size = loop {
            let want = surface.drawable_size();
            if want.is_zero() {
                debug!("drawable is 0x0, waiting for window events");
            } else {
                let extent = backend.surface_extent(want)?;
                if !extent.is_zero() {
                    break extent;
                }
                debug!(
                    "surface is 0x0 for a {}x{} drawable, waiting for window events",
                    want.width, want.height
                );
            }
            if !surface.wait_events() {
                info!("window closed while minimized");
                return Ok(false);
            }
        };

        info!("rebuild ({:?}) → {}x{}", reason, size.width, size.height);
        backend.wait_idle()?;

        for stage in TEARDOWN_ORDER {
            backend.destroy_stage(stage);
        }
        for stage in BUILD_ORDER {
            backend.create_stage(stage, size)?;
        }

        let count = backend.image_count();
        if count == 0 {
            bail!("rebuilt swapchain reports zero images");
        }
        backend.resize_slots(count)?;
        if count != self.slots.len() {
            info!("frame slots {} → {}", self.slots.len(), count);
        }
        self.slots = vec![SlotState::Idle; count];
        self.guards = vec![None; count];
        self.cursor = 0;
        self.pending = None;
        self.suboptimal_seen = false;
        self.rebuilds += 1;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_torn_down_stage_is_rebuilt_once() {
        for stage in TEARDOWN_ORDER {
            assert_eq!(BUILD_ORDER.iter().filter(|&&s| s == stage).count(), 1);
        }
        assert_eq!(TEARDOWN_ORDER[0], RebuildStage::Pipeline);
        assert_eq!(BUILD_ORDER[0], RebuildStage::Swapchain);
        assert_eq!(BUILD_ORDER[5], RebuildStage::DrawCommands);
    }

    #[test]
    fn scene_is_submitted_before_overlay() {
        assert_eq!(SUBMIT_ORDER, [CommandStream::Scene, CommandStream::Overlay]);
    }

    #[test]
    fn fresh_loop_is_idle_and_unguarded() {
        let l = FrameLoop::new(3);
        assert_eq!(l.slot_count(), 3);
        assert_eq!(l.current_slot(), 0);
        assert!((0..3).all(|s| l.slot_state(s) == SlotState::Idle));
        assert!((0..3).all(|i| l.image_guard(i).is_none()));
        assert_eq!(l.slot_state(9), SlotState::Idle);
    }
}
