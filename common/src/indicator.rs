/// Status LED or anything else that can show an on/off heartbeat.
pub trait StatusIndicator {
    fn set(&mut self, on: bool);
}

/// Heartbeat toggling every `interval_ms`, driven by a faster poll loop.
#[derive(Debug, Clone)]
pub struct BlinkTimer {
    interval_ms: u64,
    last_toggle_ms: Option<u64>,
    on: bool,
}

impl BlinkTimer {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            last_toggle_ms: None,
            on: false,
        }
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    /// Returns the new level when a toggle is due.
    pub fn poll(&mut self, now_ms: u64) -> Option<bool> {
        let due = match self.last_toggle_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= self.interval_ms,
        };
        if !due {
            return None;
        }
        self.last_toggle_ms = Some(now_ms);
        self.on = !self.on;
        Some(self.on)
    }

    pub fn drive(&mut self, indicator: &mut impl StatusIndicator, now_ms: u64) {
        if let Some(on) = self.poll(now_ms) {
            indicator.set(on);
        }
    }
}
