// SPDX-License-Identifier: CEPL-1.0
//! The per-frame acquire, build, submit, present path of a [`Swapchain`].
use std::time::{Duration, Instant};

use ash::prelude::VkResult;
use ash::vk;
use tracing::{debug, trace};

use crate::device::{RenderPassBegin, SubmitBatch};
use crate::error::{InitError, PresentError, Result, ResultExt};
use crate::queue::SyncQueue;
use crate::swapchain::Swapchain;

/// Where a swapchain is in its frame cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FrameStage {
    #[default]
    Idle,
    Acquiring,
    /// Blocked on the slot fence until the GPU is done with the slot.
    SlotWait,
    Building,
    Submitting,
    Presenting,
    /// The surface changed under the swapchain; a recreation is running.
    Invalidated,
}

/// Outcome of one [`Swapchain::draw`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    Presented { image_index: u32 },
    /// The surface was out of date or suboptimal. The swapchain was rebuilt
    /// and nothing was presented.
    Recreated,
    /// The surface has no area (minimized). Nothing was drawn.
    Suspended,
}

/// Rolling average of `queue_submit` wall time.
#[derive(Debug, Default)]
pub struct SubmitStats {
    frames: u64,
    window_total: Duration,
    window_frames: u32,
}

impl SubmitStats {
    pub const WINDOW: u32 = 100;

    /// Adds one sample. Returns the window average when a window completes.
    pub fn record(&mut self, elapsed: Duration) -> Option<Duration> {
        self.frames += 1;
        self.window_total += elapsed;
        self.window_frames += 1;
        if self.window_frames < Self::WINDOW {
            return None;
        }
        let avg = self.window_total / self.window_frames;
        self.window_total = Duration::ZERO;
        self.window_frames = 0;
        Some(avg)
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl Swapchain {
    pub(crate) fn set_stage(&mut self, next: FrameStage) {
        if self.stage != next {
            trace!(from = ?self.stage, to = ?next, "frame stage");
            self.stage = next;
        }
    }

    // STRICT PER-FRAME ORDER:
    // 0) a pending acquire or missing slots from an earlier failure: recreate
    // 1) acquire_next_image (signals image_acquired)
    // 2) wait slot fence (only CPU back-pressure point)
    // 3) dynamic callback records the slot's dynamic buffer
    // 4) reset slot fence, one submit: dynamic then static batch
    // 5) queue_present (waits frame_complete)
    // Only 1) and 5) treat OUT_OF_DATE / SUBOPTIMAL as recoverable.
    /// Draws one frame. `dynamic` records the slot's dynamic buffer (begin and
    /// end included) and receives the slot index and a prepared render pass
    /// begin for that slot.
    pub fn draw<F>(&mut self, queue: &SyncQueue, mut dynamic: F) -> Result<FrameStatus>
    where
        F: FnMut(vk::CommandBuffer, usize, &RenderPassBegin) -> VkResult<()>,
    {
        if let Some(e) = self.init_error {
            return Err(e.into());
        }
        // The last frame acquired an image and then failed before its
        // submission; acquiring again would signal `image_acquired` twice.
        if self.acquire_pending {
            return self.invalidate("previous frame failed after acquire");
        }
        if self.fences.is_empty() && !self.suspended {
            return self.invalidate("previous recreate failed");
        }
        if self.suspended {
            if !self.surface_has_area()? {
                return Ok(FrameStatus::Suspended);
            }
            debug!("surface has area again; resuming");
            return self.invalidate("resume");
        }

        self.set_stage(FrameStage::Acquiring);
        let image_index = match self.device.acquire_next_image(
            self.swapchain,
            u64::MAX,
            self.image_acquired,
        ) {
            Ok((index, false)) => index,
            Ok((_, true)) => {
                self.acquire_pending = true;
                return self.invalidate("acquire_next_image: suboptimal");
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                return self.invalidate("acquire_next_image: out of date");
            }
            Err(result) => {
                return Err(PresentError::Device {
                    op: "acquire_next_image",
                    result,
                })
            }
        };
        // Cleared once a submission waits on the semaphore.
        self.acquire_pending = true;

        let slot = image_index as usize;
        let Some(&fence) = self.fences.get(slot) else {
            return Err(PresentError::Device {
                op: "wait_for_fences",
                result: vk::Result::ERROR_UNKNOWN,
            });
        };
        self.set_stage(FrameStage::SlotWait);
        self.device
            .wait_for_fences(&[fence], u64::MAX)
            .during("wait_for_fences")?;

        self.set_stage(FrameStage::Building);
        let cmd = self.dynamic_cbs[slot];
        let begin = self.render_pass_begin(slot);
        dynamic(cmd, slot, &begin).map_err(|result| PresentError::Callback {
            op: "dynamic commands",
            result,
        })?;

        self.set_stage(FrameStage::Submitting);
        self.device
            .reset_fences(&[fence])
            .during("reset_fences")?;
        let batches = [
            SubmitBatch {
                wait_semaphore: Some(self.image_acquired),
                wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                command_buffer: Some(cmd),
                signal_semaphore: Some(self.dynamic_complete),
            },
            SubmitBatch {
                wait_semaphore: Some(self.dynamic_complete),
                wait_stage: vk::PipelineStageFlags::ALL_COMMANDS,
                command_buffer: Some(self.static_cbs[slot]),
                signal_semaphore: Some(self.frame_complete),
            },
        ];
        let started = Instant::now();
        if let Err(result) = queue.submit(&*self.device, &batches, fence) {
            // A failed submit leaves the fence unsignaled with nothing
            // pending on it.
            self.restore_slot_fence(slot);
            return Err(PresentError::Device {
                op: "queue_submit",
                result,
            });
        }
        self.acquire_pending = false;
        if let Some(avg) = self.stats.record(started.elapsed()) {
            debug!(
                "queue_submit: {:?} average over the last {} frames",
                avg,
                SubmitStats::WINDOW
            );
        }

        self.set_stage(FrameStage::Presenting);
        let presented = match &self.present_queue {
            Some(present) => present.present(
                &*self.device,
                self.swapchain,
                image_index,
                self.frame_complete,
            ),
            None => return Err(InitError::NoPresentFamily.into()),
        };
        match presented {
            Ok(false) => {
                self.set_stage(FrameStage::Idle);
                Ok(FrameStatus::Presented { image_index })
            }
            Ok(true) => self.invalidate("queue_present: suboptimal"),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.invalidate("queue_present: out of date")
            }
            Err(result) => Err(PresentError::Device {
                op: "queue_present",
                result,
            }),
        }
    }

    /// Draws a frame whose dynamic buffer records nothing, so only the
    /// static commands run.
    pub fn draw_static(&mut self, queue: &SyncQueue) -> Result<FrameStatus> {
        let device = self.device.clone();
        self.draw(queue, move |cmd, _, _| device.record_empty(cmd))
    }

    fn invalidate(&mut self, reason: &'static str) -> Result<FrameStatus> {
        debug!("{reason}; recreating swapchain");
        self.set_stage(FrameStage::Invalidated);
        self.recreate()?;
        Ok(if self.suspended {
            FrameStatus::Suspended
        } else {
            FrameStatus::Recreated
        })
    }

    /// Submit timing collected by [`Swapchain::draw`].
    pub fn submit_stats(&self) -> &SubmitStats {
        &self.stats
    }
}
