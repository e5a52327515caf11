//! VM lifecycle controller: image library, cloud-init builder, templates, process supervision,
//! lifecycle orchestration, metrics collection and the VNC bridge.

pub mod cloudinit;
pub mod image;
pub mod lifecycle;
pub mod metrics;
pub mod supervisor;
pub mod templates;
pub mod vnc_bridge;

pub use image::ImageLibrary;
pub use lifecycle::{CreateRequest, LifecycleController};
pub use metrics::MetricsCollector;
pub use vnc_bridge::VncBridgeController;

use std::collections::HashMap;
use std::sync::Arc;
use vps_common::{ServerConfig, Template};

/// Bundles the collaborators a fresh `LifecycleController` needs, built once at startup.
pub struct Controller {
    pub lifecycle: LifecycleController,
    pub metrics: MetricsCollector,
}

impl Controller {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        let templates: Arc<HashMap<String, Template>> = Arc::new(templates::builtin_templates());
        let vnc = VncBridgeController::new();
        let metrics = MetricsCollector::new();
        let lifecycle = LifecycleController::new(config, templates, vnc, metrics.clone());
        Self { lifecycle, metrics }
    }

    /// Spawns the metrics ticker as a background task; returns its handle so the caller can
    /// track it alongside the other supervised tasks.
    pub fn spawn_metrics_loop(&self) -> tokio::task::JoinHandle<()> {
        let metrics = self.metrics.clone();
        tokio::spawn(metrics.run())
    }
}
