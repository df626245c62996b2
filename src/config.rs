use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default engine binary name, looked up next to the running executable
/// when no explicit path is configured.
pub const ENGINE_BINARY_NAME: &str = "posecast-engine";

/// Server-wide configuration for session creation.
/// Keeps lifecycle and buffering knobs small and explicit.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ServerConfig {
    /// Path to the engine executable (`None` = sibling of the current
    /// executable named `posecast-engine`).
    pub engine_binary: Option<PathBuf>,

    /// Target production cadence in frames per second (`None` = 60).
    pub target_fps: Option<f64>,

    /// Number of shared-memory slots per session (`None` = 3, floor 2).
    pub slots: Option<usize>,

    /// Init handshake deadline **in milliseconds** (`None` = 10 000).
    pub init_timeout_ms: Option<u64>,

    /// Engine shutdown grace period **in milliseconds** (`None` = 2 000).
    pub shutdown_timeout_ms: Option<u64>,

    /// Prefix for shared-memory names (`None` = "posecast").
    pub shm_prefix: Option<String>,
}

impl ServerConfig {
    pub fn target_fps(&self) -> f64 {
        let fps = self.target_fps.unwrap_or(60.0);
        if fps.is_finite() && fps > 0.0 { fps } else { 60.0 }
    }

    pub fn slots(&self) -> usize {
        // Two is the correctness floor: one slot in flight, one under construction.
        self.slots.unwrap_or(3).max(2)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms.unwrap_or(10_000))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms.unwrap_or(2_000))
    }

    pub fn shm_prefix(&self) -> &str {
        self.shm_prefix.as_deref().unwrap_or("posecast")
    }

    /// Resolve the engine executable path.
    pub fn engine_binary(&self) -> PathBuf {
        if let Some(path) = &self.engine_binary {
            return path.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(ENGINE_BINARY_NAME)))
            .unwrap_or_else(|| PathBuf::from(ENGINE_BINARY_NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.target_fps(), 60.0);
        assert_eq!(cfg.slots(), 3);
        assert_eq!(cfg.init_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.shutdown_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.shm_prefix(), "posecast");
    }

    #[test]
    fn slots_floor_is_two() {
        let cfg = ServerConfig {
            slots: Some(1),
            ..Default::default()
        };
        assert_eq!(cfg.slots(), 2);
    }

    #[test]
    fn bogus_fps_falls_back() {
        let cfg = ServerConfig {
            target_fps: Some(0.0),
            ..Default::default()
        };
        assert_eq!(cfg.target_fps(), 60.0);
    }
}
