// SPDX-License-Identifier: CEPL-1.0
use ash::prelude::VkResult;
use ash::vk;
use thiserror::Error;

/// Reasons a context or swapchain could not be brought up. These are logged
/// and leave the swapchain in a not-ready state rather than aborting.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum InitError {
    #[error("no queue family supports both graphics and compute")]
    NoGraphicsComputeFamily,
    #[error("no graphics queue family can present to this surface")]
    NoPresentFamily,
    #[error("surface does not offer FIFO presentation")]
    NoFifoPresentMode,
    #[error("surface reports no formats")]
    NoSurfaceFormats,
}

#[derive(Debug, Error)]
pub enum PresentError {
    /// A device call returned something other than success or a surface
    /// invalidation; device loss or misuse, nothing to retry.
    #[error("{op} failed: {result}")]
    Device { op: &'static str, result: vk::Result },
    #[error("{op} callback failed: {result}")]
    Callback { op: &'static str, result: vk::Result },
    #[error("swapchain is not ready: {0}")]
    NotReady(#[from] InitError),
}

impl PresentError {
    pub fn result(&self) -> Option<vk::Result> {
        match self {
            Self::Device { result, .. } | Self::Callback { result, .. } => Some(*result),
            Self::NotReady(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PresentError>;

/// Tags a raw `VkResult` with the name of the call that produced it.
pub trait ResultExt<T> {
    fn during(self, op: &'static str) -> Result<T>;
}

impl<T> ResultExt<T> for VkResult<T> {
    fn during(self, op: &'static str) -> Result<T> {
        self.map_err(|result| PresentError::Device { op, result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn during_names_the_call() {
        let err = Err::<(), _>(vk::Result::ERROR_DEVICE_LOST)
            .during("queue_submit")
            .unwrap_err();
        assert!(err.to_string().starts_with("queue_submit failed"));
        assert_eq!(err.result(), Some(vk::Result::ERROR_DEVICE_LOST));
    }

    #[test]
    fn init_errors_convert() {
        let err: PresentError = InitError::NoFifoPresentMode.into();
        assert!(matches!(err, PresentError::NotReady(InitError::NoFifoPresentMode)));
        assert_eq!(err.result(), None);
    }
}
