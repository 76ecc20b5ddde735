// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
mod config;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser;
use tandem_core::{init_tracing, StopFlag};
use tandem_platform::open_windows;
use tandem_vk::{Context, ContextConfig};
use tracing::{debug, error, info};

use tandem_platform::winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window, WindowId},
};

use crate::config::{load_cfg, AppCfg};
use crate::worker::WorkerCfg;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file; missing means defaults
    #[arg(long, default_value = "tandem.toml")]
    config: PathBuf,
    /// Number of windows, overrides the config
    #[arg(long)]
    windows: Option<usize>,
}

struct App {
    cfg: AppCfg,
    windows: Vec<Window>,
    ctx: Option<Arc<Context>>,
    workers: Vec<JoinHandle<()>>,
    stop: StopFlag,
    started: bool,
}

impl App {
    fn start(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let titles: Vec<String> = (0..self.cfg.windows.count)
            .map(|i| format!("tandem #{i}"))
            .collect();
        self.windows = open_windows(
            event_loop,
            &titles,
            self.cfg.windows.width,
            self.cfg.windows.height,
        )?;

        let ctx_cfg = ContextConfig {
            app_name: "tandem".to_owned(),
            validation: self.cfg.render.validation,
            pool_sizes: self.cfg.pools.into(),
            pipeline_cache_path: self.cfg.pipeline_cache.path.clone(),
        };
        let ctx = Arc::new(Context::new(&ctx_cfg, event_loop).context("vulkan init")?);
        self.ctx = Some(ctx.clone());

        // Surfaces are created here, each is then owned by its render thread.
        for (window, title) in self.windows.iter().zip(titles) {
            let surface = ctx.create_surface(window, window)?;
            let handle = worker::spawn(
                ctx.clone(),
                surface,
                WorkerCfg {
                    name: title,
                    clear_color: self.cfg.render.clear_color,
                    frame_interval: Duration::from_millis(self.cfg.render.frame_interval_ms),
                },
                self.stop.clone(),
            )?;
            self.workers.push(handle);
        }
        info!("{} render threads running", self.workers.len());
        Ok(())
    }

    // STRICT ORDER: workers (and their swapchains) -> context -> windows
    fn shutdown(&mut self) {
        self.stop.stop();
        for handle in self.workers.drain(..) {
            let name = handle.thread().name().unwrap_or("render").to_owned();
            if handle.join().is_err() {
                error!("{name} panicked");
            }
        }
        self.ctx = None;
        self.windows.clear();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        event_loop.set_control_flow(ControlFlow::Wait);
        if self.started {
            return;
        }
        self.started = true;
        if let Err(e) = self.start(event_loop) {
            error!("startup failed: {e:#}");
            self.shutdown();
            event_loop.exit();
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested on {window_id:?}");
                self.shutdown();
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                // Render threads pick the new extent up from the surface.
                debug!("{window_id:?} resized → {}x{}", size.width, size.height);
            }
            _ => {}
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.shutdown();
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let mut cfg = load_cfg(&args.config);
    if let Some(n) = args.windows {
        cfg.windows.count = n;
    }
    cfg.windows.count = cfg.windows.count.max(1);

    let event_loop: EventLoop<()> = EventLoop::new()?;
    let mut app = App {
        cfg,
        windows: Vec::new(),
        ctx: None,
        workers: Vec::new(),
        stop: StopFlag::new(),
        started: false,
    };

    event_loop.run_app(&mut app)?;
    Ok(())
}
