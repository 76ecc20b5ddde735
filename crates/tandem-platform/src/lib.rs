// SPDX-License-Identifier: CEPL-1.0
pub use winit;

use anyhow::{Context, Result};
use winit::dpi::PhysicalSize;
use winit::event_loop::ActiveEventLoop;
use winit::window::Window;

/// Opens one window per title, all at the same inner size.
pub fn open_windows(
    event_loop: &ActiveEventLoop,
    titles: &[String],
    width: u32,
    height: u32,
) -> Result<Vec<Window>> {
    let mut windows = Vec::with_capacity(titles.len());
    for title in titles {
        let attrs = Window::default_attributes()
            .with_title(title.as_str())
            .with_inner_size(PhysicalSize::new(width.max(1), height.max(1)));
        let window = event_loop
            .create_window(attrs)
            .with_context(|| format!("create_window({title})"))?;
        tracing::info!(
            "window '{}' opened ({}x{})",
            title,
            window.inner_size().width,
            window.inner_size().height
        );
        windows.push(window);
    }
    Ok(windows)
}
