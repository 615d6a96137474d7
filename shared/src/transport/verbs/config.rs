use std::num::NonZeroI32;

const DEFAULT_QUEUE_DEPTH: u32 = 8192;

#[derive(Debug, Clone)]
pub struct VerbsConfig {
    pub dev_name: String,
    pub gid_index: Option<NonZeroI32>,
    pub ib_port: u8,
    /// Work requests per direction the queue pair can hold; must cover a full window.
    pub queue_depth: u32,
}

impl Default for VerbsConfig {
    fn default() -> Self {
        VerbsConfig {
            dev_name: "mlx5_0".to_owned(),
            gid_index: None,
            ib_port: 1,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

impl VerbsConfig {
    /// Grow the queues so `window_depth` sends and as many receives can be outstanding.
    pub fn covering_window(mut self, window_depth: usize) -> Self {
        let needed = u32::try_from(window_depth).unwrap_or(u32::MAX);
        self.queue_depth = self.queue_depth.max(needed);
        self
    }
}
