// SPDX-License-Identifier: CEPL-1.0
//! Frame loop driven against an in-memory device that tracks fence state and
//! panics if per-image resources are touched while the GPU may still use them.

use anyhow::{anyhow, Result};
use lantern_render::frame::{
    Acquired, CommandStream, FrameBackend, FrameLoop, FrameOutcome, RebuildStage, SlotState,
    SurfaceInvalid, SwapchainOutcome, BUILD_ORDER, TEARDOWN_ORDER,
};
use lantern_render::{DrawableSurface, RenderSize, SceneUniforms};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Wait(usize),
    Reset(usize),
    Acquire(usize),
    Uniforms(usize),
    Overlay(usize),
    Submit {
        slot: usize,
        image: usize,
        batch: Vec<CommandStream>,
    },
    Present(usize),
    WaitIdle,
    Destroy(RebuildStage),
    Create(RebuildStage, RenderSize),
    ResizeSlots(usize),
}

#[derive(Debug, Clone, Copy)]
enum Script {
    Image(usize),
    Suboptimal(usize),
    OutOfDate,
    Lost,
}

struct FakeDevice {
    calls: Vec<Call>,
    images: usize,
    next_images: usize,
    /// Per slot: true once the fence has signaled (or was never used).
    signaled: Vec<bool>,
    /// Submissions not yet retired, in queue order.
    queue: VecDeque<(usize, usize)>,
    acquire_script: VecDeque<Script>,
    present_script: VecDeque<Script>,
    /// Extents reported by the surface before it settles on the drawable size.
    surface_script: VecDeque<RenderSize>,
    round_robin: usize,
    live: HashMap<RebuildStage, u32>,
    next_handle: u32,
    created: Vec<u32>,
    destroyed: Vec<u32>,
}

impl FakeDevice {
    fn new(images: usize) -> Self {
        let mut dev = Self {
            calls: Vec::new(),
            images,
            next_images: images,
            signaled: vec![true; images],
            queue: VecDeque::new(),
            acquire_script: VecDeque::new(),
            present_script: VecDeque::new(),
            surface_script: VecDeque::new(),
            round_robin: 0,
            live: HashMap::new(),
            next_handle: 1,
            created: Vec::new(),
            destroyed: Vec::new(),
        };
        let size = RenderSize {
            width: 800,
            height: 600,
        };
        for stage in BUILD_ORDER {
            dev.create_stage(stage, size).unwrap();
        }
        dev.calls.clear();
        dev
    }

    fn image_busy(&self, image: usize) -> bool {
        self.queue.iter().any(|&(_, i)| i == image)
    }

    /// Retire queue entries up to and including the last one signalling `slot`.
    fn retire_through(&mut self, slot: usize) {
        if let Some(last) = self.queue.iter().rposition(|&(s, _)| s == slot) {
            for (s, _) in self.queue.drain(..=last) {
                self.signaled[s] = true;
            }
        }
    }

    fn submits(&self) -> Vec<&Call> {
        self.calls
            .iter()
            .filter(|c| matches!(c, Call::Submit { .. }))
            .collect()
    }

    fn stage_calls(&self) -> Vec<Call> {
        self.calls
            .iter()
            .filter(|c| matches!(c, Call::Destroy(_) | Call::Create(..)))
            .cloned()
            .collect()
    }

    fn shutdown(&mut self) {
        self.wait_idle().unwrap();
        for stage in TEARDOWN_ORDER {
            self.destroy_stage(stage);
        }
        self.destroy_stage(RebuildStage::DrawCommands);
    }
}

impl FrameBackend for FakeDevice {
    fn image_count(&self) -> usize {
        self.images
    }

    fn surface_extent(&mut self, want: RenderSize) -> Result<RenderSize> {
        Ok(self.surface_script.pop_front().unwrap_or(want))
    }

    fn wait_slot(&mut self, slot: usize) -> Result<()> {
        self.calls.push(Call::Wait(slot));
        self.retire_through(slot);
        Ok(())
    }

    fn reset_slot(&mut self, slot: usize) -> Result<()> {
        assert!(self.signaled[slot], "reset of slot {slot} before its fence was waited");
        self.calls.push(Call::Reset(slot));
        self.signaled[slot] = false;
        Ok(())
    }

    fn acquire(&mut self, slot: usize) -> Result<SwapchainOutcome<Acquired>> {
        self.calls.push(Call::Acquire(slot));
        let step = self.acquire_script.pop_front().unwrap_or_else(|| {
            let i = self.round_robin % self.images;
            self.round_robin += 1;
            Script::Image(i)
        });
        match step {
            Script::Image(image) => Ok(SwapchainOutcome::Ready(Acquired {
                image,
                suboptimal: false,
            })),
            Script::Suboptimal(image) => Ok(SwapchainOutcome::Ready(Acquired {
                image,
                suboptimal: true,
            })),
            Script::OutOfDate => Ok(SwapchainOutcome::Retry(SurfaceInvalid::OutOfDate)),
            Script::Lost => Err(anyhow!("vkAcquireNextImageKHR failed: ERROR_DEVICE_LOST")),
        }
    }

    fn write_uniforms(&mut self, image: usize, _u: &SceneUniforms) -> Result<()> {
        assert!(!self.image_busy(image), "uniforms of image {image} written while in flight");
        self.calls.push(Call::Uniforms(image));
        Ok(())
    }

    fn record_overlay(&mut self, image: usize) -> Result<()> {
        assert!(!self.image_busy(image), "overlay for image {image} re-recorded while in flight");
        self.calls.push(Call::Overlay(image));
        Ok(())
    }

    fn submit(&mut self, slot: usize, image: usize, batch: &[CommandStream]) -> Result<()> {
        assert!(!self.signaled[slot], "submit on slot {slot} without resetting its fence");
        assert!(!self.image_busy(image), "image {image} submitted twice while in flight");
        self.calls.push(Call::Submit {
            slot,
            image,
            batch: batch.to_vec(),
        });
        self.queue.push_back((slot, image));
        Ok(())
    }

    fn present(&mut self, image: usize) -> Result<SwapchainOutcome<bool>> {
        self.calls.push(Call::Present(image));
        match self.present_script.pop_front() {
            None | Some(Script::Image(_)) => Ok(SwapchainOutcome::Ready(false)),
            Some(Script::Suboptimal(_)) => Ok(SwapchainOutcome::Ready(true)),
            Some(Script::OutOfDate) => Ok(SwapchainOutcome::Retry(SurfaceInvalid::OutOfDate)),
            Some(Script::Lost) => Err(anyhow!("vkQueuePresentKHR failed: ERROR_DEVICE_LOST")),
        }
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.calls.push(Call::WaitIdle);
        while let Some((s, _)) = self.queue.pop_front() {
            self.signaled[s] = true;
        }
        Ok(())
    }

    fn destroy_stage(&mut self, stage: RebuildStage) {
        assert!(self.queue.is_empty(), "{stage:?} destroyed while work is in flight");
        self.calls.push(Call::Destroy(stage));
        if let Some(handle) = self.live.remove(&stage) {
            self.destroyed.push(handle);
        }
    }

    fn create_stage(&mut self, stage: RebuildStage, size: RenderSize) -> Result<()> {
        assert!(!size.is_zero(), "{stage:?} created at zero size");
        self.calls.push(Call::Create(stage, size));
        if stage == RebuildStage::Swapchain {
            self.images = self.next_images;
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        if let Some(old) = self.live.insert(stage, handle) {
            // command buffers are re-recorded in place; anything else is a leak
            assert_eq!(stage, RebuildStage::DrawCommands, "{stage:?} created twice");
            self.destroyed.push(old);
        }
        self.created.push(handle);
        Ok(())
    }

    fn resize_slots(&mut self, count: usize) -> Result<()> {
        self.calls.push(Call::ResizeSlots(count));
        if count != self.signaled.len() {
            assert!(self.queue.is_empty());
            self.signaled = vec![true; count];
        }
        Ok(())
    }
}

struct FakeWindow {
    size: RenderSize,
    after_wait: VecDeque<RenderSize>,
    resized: bool,
    waits: usize,
    open: bool,
}

impl FakeWindow {
    fn new(width: u32, height: u32) -> Self {
        Self {
            size: RenderSize { width, height },
            after_wait: VecDeque::new(),
            resized: false,
            waits: 0,
            open: true,
        }
    }
}

impl DrawableSurface for FakeWindow {
    fn drawable_size(&self) -> RenderSize {
        self.size
    }

    fn take_resized(&mut self) -> bool {
        std::mem::take(&mut self.resized)
    }

    fn wait_events(&mut self) -> bool {
        self.waits += 1;
        match self.after_wait.pop_front() {
            Some(size) => {
                self.size = size;
                true
            }
            None => self.open,
        }
    }
}

fn size(width: u32, height: u32) -> RenderSize {
    RenderSize { width, height }
}

fn expected_rebuild(at: RenderSize) -> Vec<Call> {
    TEARDOWN_ORDER
        .iter()
        .map(|&s| Call::Destroy(s))
        .chain(BUILD_ORDER.iter().map(|&s| Call::Create(s, at)))
        .collect()
}

#[test]
fn steady_state_round_robins_slots() {
    let mut dev = FakeDevice::new(3);
    let mut win = FakeWindow::new(800, 600);
    let mut frames = FrameLoop::new(3);
    let u = SceneUniforms::default();

    for n in 0..7 {
        let out = frames.step(&mut dev, &mut win, &u).unwrap();
        assert_eq!(
            out,
            FrameOutcome::Presented {
                image: n % 3,
                suboptimal: false
            }
        );
        assert_eq!(frames.current_slot(), (n + 1) % 3);
        assert_eq!(frames.slot_state(n % 3), SlotState::Presenting);
    }
    assert_eq!(dev.submits().len(), 7);
    assert!(!dev.calls.contains(&Call::WaitIdle));
}

#[test]
fn fence_wait_precedes_reset_and_recording() {
    let mut dev = FakeDevice::new(2);
    let mut win = FakeWindow::new(800, 600);
    let mut frames = FrameLoop::new(2);
    frames
        .step(&mut dev, &mut win, &SceneUniforms::default())
        .unwrap();

    assert_eq!(
        dev.calls,
        vec![
            Call::Wait(0),
            Call::Acquire(0),
            Call::Reset(0),
            Call::Uniforms(0),
            Call::Overlay(0),
            Call::Submit {
                slot: 0,
                image: 0,
                batch: vec![CommandStream::Scene, CommandStream::Overlay]
            },
            Call::Present(0),
        ]
    );
}

#[test]
fn out_of_order_image_waits_for_its_guarding_slot() {
    let mut dev = FakeDevice::new(3);
    let mut win = FakeWindow::new(800, 600);
    let mut frames = FrameLoop::new(3);
    let u = SceneUniforms::default();
    // slot 0 -> image 0, slot 1 -> image 1, slot 2 -> image 0 again
    dev.acquire_script.extend([Script::Image(0), Script::Image(1), Script::Image(0)]);

    frames.step(&mut dev, &mut win, &u).unwrap();
    frames.step(&mut dev, &mut win, &u).unwrap();
    assert_eq!(frames.image_guard(0), Some(0));
    dev.calls.clear();

    // The fake panics if image 0 is written before slot 0's fence retires it.
    let out = frames.step(&mut dev, &mut win, &u).unwrap();
    assert_eq!(
        out,
        FrameOutcome::Presented {
            image: 0,
            suboptimal: false
        }
    );
    assert_eq!(
        &dev.calls[..4],
        &[Call::Wait(2), Call::Acquire(2), Call::Wait(0), Call::Reset(2)]
    );
    assert_eq!(frames.image_guard(0), Some(2));
}

#[test]
fn same_slot_reacquiring_its_image_does_not_wait_twice() {
    let mut dev = FakeDevice::new(2);
    let mut win = FakeWindow::new(800, 600);
    let mut frames = FrameLoop::new(2);
    let u = SceneUniforms::default();
    dev.acquire_script.extend([Script::Image(1), Script::Image(0), Script::Image(1)]);

    for _ in 0..3 {
        frames.step(&mut dev, &mut win, &u).unwrap();
    }
    let waits = dev.calls.iter().filter(|c| matches!(c, Call::Wait(_))).count();
    assert_eq!(waits, 3);
}

#[test]
fn acquire_out_of_date_rebuilds_without_submitting() {
    let mut dev = FakeDevice::new(3);
    let mut win = FakeWindow::new(800, 600);
    let mut frames = FrameLoop::new(3);
    let u = SceneUniforms::default();

    frames.step(&mut dev, &mut win, &u).unwrap();
    dev.calls.clear();

    win.size = size(1024, 768);
    dev.acquire_script.push_back(Script::OutOfDate);
    let out = frames.step(&mut dev, &mut win, &u).unwrap();
    assert_eq!(out, FrameOutcome::Rebuilt(SurfaceInvalid::OutOfDate));
    assert!(dev.submits().is_empty());
    assert!(!dev.calls.iter().any(|c| matches!(c, Call::Reset(_))));

    let idle = dev.calls.iter().position(|c| *c == Call::WaitIdle).unwrap();
    let first_destroy = dev
        .calls
        .iter()
        .position(|c| matches!(c, Call::Destroy(_)))
        .unwrap();
    assert!(idle < first_destroy);
    assert_eq!(dev.stage_calls(), expected_rebuild(size(1024, 768)));
    assert_eq!(frames.current_slot(), 0);

    dev.calls.clear();
    let out = frames.step(&mut dev, &mut win, &u).unwrap();
    assert!(matches!(out, FrameOutcome::Presented { .. }));
    assert_eq!(dev.submits().len(), 1);
}

#[test]
fn present_out_of_date_rebuilds_after_the_submit() {
    let mut dev = FakeDevice::new(2);
    let mut win = FakeWindow::new(800, 600);
    let mut frames = FrameLoop::new(2);
    dev.present_script.push_back(Script::OutOfDate);

    let out = frames
        .step(&mut dev, &mut win, &SceneUniforms::default())
        .unwrap();
    assert_eq!(out, FrameOutcome::Rebuilt(SurfaceInvalid::OutOfDate));
    assert_eq!(dev.submits().len(), 1);
    assert_eq!(frames.rebuild_count(), 1);
    assert_eq!(frames.image_guard(0), None);
}

#[test]
fn suboptimal_is_presented_not_rebuilt() {
    let mut dev = FakeDevice::new(2);
    let mut win = FakeWindow::new(800, 600);
    let mut frames = FrameLoop::new(2);
    let u = SceneUniforms::default();
    dev.acquire_script.push_back(Script::Suboptimal(0));
    dev.present_script.extend([Script::Image(0), Script::Suboptimal(1)]);

    let a = frames.step(&mut dev, &mut win, &u).unwrap();
    let b = frames.step(&mut dev, &mut win, &u).unwrap();
    assert_eq!(
        a,
        FrameOutcome::Presented {
            image: 0,
            suboptimal: true
        }
    );
    assert!(matches!(b, FrameOutcome::Presented { suboptimal: true, .. }));
    assert_eq!(frames.rebuild_count(), 0);
    assert!(dev.stage_calls().is_empty());
}

#[test]
fn rebuild_order_holds_for_every_trigger() {
    let mut dev = FakeDevice::new(3);
    let mut win = FakeWindow::new(800, 600);
    let mut frames = FrameLoop::new(3);
    let u = SceneUniforms::default();

    dev.acquire_script
        .extend([Script::OutOfDate, Script::OutOfDate, Script::OutOfDate]);
    for _ in 0..3 {
        let out = frames.step(&mut dev, &mut win, &u).unwrap();
        assert_eq!(out, FrameOutcome::Rebuilt(SurfaceInvalid::OutOfDate));
    }
    win.resized = true;
    frames.step(&mut dev, &mut win, &u).unwrap();

    let expected: Vec<Call> = (0..4).flat_map(|_| expected_rebuild(size(800, 600))).collect();
    assert_eq!(dev.stage_calls(), expected);
    assert_eq!(frames.rebuild_count(), 4);
}

#[test]
fn back_to_back_rebuilds_release_every_handle_once() {
    let mut dev = FakeDevice::new(3);
    let mut win = FakeWindow::new(800, 600);
    let mut frames = FrameLoop::new(3);
    let u = SceneUniforms::default();

    frames.step(&mut dev, &mut win, &u).unwrap();
    frames
        .rebuild(&mut dev, &mut win, SurfaceInvalid::OutOfDate)
        .unwrap();
    frames
        .rebuild(&mut dev, &mut win, SurfaceInvalid::OutOfDate)
        .unwrap();
    frames.step(&mut dev, &mut win, &u).unwrap();
    dev.shutdown();
    // destroying again after shutdown must be harmless
    for stage in TEARDOWN_ORDER {
        dev.destroy_stage(stage);
    }

    let mut created = dev.created.clone();
    let mut destroyed = dev.destroyed.clone();
    created.sort_unstable();
    destroyed.sort_unstable();
    assert_eq!(created, destroyed);
    assert!(dev.live.is_empty());
}

#[test]
fn zero_size_blocks_until_the_window_is_restored() {
    let mut dev = FakeDevice::new(2);
    let mut win = FakeWindow::new(0, 0);
    let mut frames = FrameLoop::new(2);
    win.after_wait
        .extend([size(0, 0), size(640, 0), size(640, 480)]);
    win.resized = true;

    let out = frames
        .step(&mut dev, &mut win, &SceneUniforms::default())
        .unwrap();
    assert_eq!(out, FrameOutcome::Rebuilt(SurfaceInvalid::Resized));
    assert_eq!(win.waits, 3);
    assert_eq!(dev.stage_calls(), expected_rebuild(size(640, 480)));
}

#[test]
fn closing_while_minimized_leaves_resources_alone() {
    let mut dev = FakeDevice::new(2);
    let mut win = FakeWindow::new(0, 0);
    let mut frames = FrameLoop::new(2);
    win.open = false;
    dev.acquire_script.push_back(Script::OutOfDate);

    let out = frames
        .step(&mut dev, &mut win, &SceneUniforms::default())
        .unwrap();
    assert_eq!(out, FrameOutcome::Closed);
    assert!(!dev.calls.contains(&Call::WaitIdle));
    assert!(dev.stage_calls().is_empty());
}

#[test]
fn image_count_change_resizes_slots() {
    let mut dev = FakeDevice::new(3);
    let mut win = FakeWindow::new(800, 600);
    let mut frames = FrameLoop::new(3);
    let u = SceneUniforms::default();

    frames.step(&mut dev, &mut win, &u).unwrap();
    dev.next_images = 2;
    frames.request_rebuild();
    let out = frames.step(&mut dev, &mut win, &u).unwrap();
    assert_eq!(out, FrameOutcome::Rebuilt(SurfaceInvalid::Resized));
    assert_eq!(frames.slot_count(), 2);
    assert!(dev.calls.contains(&Call::ResizeSlots(2)));

    for n in 0..4 {
        let out = frames.step(&mut dev, &mut win, &u).unwrap();
        assert!(matches!(out, FrameOutcome::Presented { .. }));
        assert_eq!(frames.current_slot(), (n + 1) % 2);
    }
}

#[test]
fn scene_and_overlay_share_one_submit_for_image_one() {
    let mut dev = FakeDevice::new(3);
    let mut win = FakeWindow::new(800, 600);
    let mut frames = FrameLoop::new(3);
    dev.acquire_script.push_back(Script::Image(1));

    frames
        .step(&mut dev, &mut win, &SceneUniforms::default())
        .unwrap();

    let submits = dev.submits();
    assert_eq!(submits.len(), 1);
    assert_eq!(
        submits[0],
        &Call::Submit {
            slot: 0,
            image: 1,
            batch: vec![CommandStream::Scene, CommandStream::Overlay]
        }
    );
    let overlay = dev.calls.iter().position(|c| *c == Call::Overlay(1)).unwrap();
    let submit = dev
        .calls
        .iter()
        .position(|c| matches!(c, Call::Submit { .. }))
        .unwrap();
    assert!(overlay < submit);
}

#[test]
fn fatal_acquire_error_propagates() {
    let mut dev = FakeDevice::new(2);
    let mut win = FakeWindow::new(800, 600);
    let mut frames = FrameLoop::new(2);
    dev.acquire_script.push_back(Script::Lost);

    let err = frames
        .step(&mut dev, &mut win, &SceneUniforms::default())
        .unwrap_err();
    assert!(err.to_string().contains("DEVICE_LOST"));
    assert!(dev.stage_calls().is_empty());
    assert!(dev.submits().is_empty());
}

#[test]
fn zero_surface_extent_waits_even_when_the_window_has_a_size() {
    let mut dev = FakeDevice::new(2);
    let mut win = FakeWindow::new(800, 600);
    let mut frames = FrameLoop::new(2);
    dev.surface_script.extend([size(0, 0), size(1024, 768)]);
    win.resized = true;

    let out = frames
        .step(&mut dev, &mut win, &SceneUniforms::default())
        .unwrap();
    assert_eq!(out, FrameOutcome::Rebuilt(SurfaceInvalid::Resized));
    assert_eq!(win.waits, 1);
    assert_eq!(dev.stage_calls(), expected_rebuild(size(1024, 768)));
}

#[test]
fn closing_while_the_surface_is_empty_leaves_resources_alone() {
    let mut dev = FakeDevice::new(2);
    let mut win = FakeWindow::new(800, 600);
    let mut frames = FrameLoop::new(2);
    win.open = false;
    dev.surface_script.push_back(size(0, 0));
    frames.request_rebuild();

    let out = frames
        .step(&mut dev, &mut win, &SceneUniforms::default())
        .unwrap();
    assert_eq!(out, FrameOutcome::Closed);
    assert!(!dev.calls.contains(&Call::WaitIdle));
    assert!(dev.stage_calls().is_empty());
}

#[test]
fn loop_without_slots_builds_them_on_the_first_step() {
    let mut dev = FakeDevice::new(3);
    let mut win = FakeWindow::new(800, 600);
    let mut frames = FrameLoop::new(0);
    frames.request_rebuild();

    let out = frames
        .step(&mut dev, &mut win, &SceneUniforms::default())
        .unwrap();
    assert_eq!(out, FrameOutcome::Rebuilt(SurfaceInvalid::Resized));
    assert_eq!(frames.slot_count(), 3);
    assert!(matches!(
        frames.step(&mut dev, &mut win, &SceneUniforms::default()),
        Ok(FrameOutcome::Presented { image: 0, .. })
    ));
}

#[test]
fn slot_stays_submitted_when_present_fails() {
    let mut dev = FakeDevice::new(2);
    let mut win = FakeWindow::new(800, 600);
    let mut frames = FrameLoop::new(2);
    let u = SceneUniforms::default();

    frames.step(&mut dev, &mut win, &u).unwrap();
    assert_eq!(frames.slot_state(0), SlotState::Presenting);
    assert_eq!(frames.slot_state(1), SlotState::Idle);

    dev.present_script.push_back(Script::Lost);
    let err = frames.step(&mut dev, &mut win, &u).unwrap_err();
    assert!(err.to_string().contains("DEVICE_LOST"));
    assert_eq!(frames.slot_state(1), SlotState::Submitted);
    assert_eq!(dev.submits().len(), 2);
}
