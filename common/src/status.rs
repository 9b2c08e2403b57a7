use std::sync::{Mutex, MutexGuard};

/// One-way setup latches shared between the orchestrator and the OTA
/// completion path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStatus {
    pub attributes_requested: bool,
    pub attributes_subscribed: bool,
    pub firmware_info_sent: bool,
    pub firmware_update_subscribed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Latch {
    AttributesRequested,
    AttributesSubscribed,
    FirmwareInfoSent,
    FirmwareUpdateSubscribed,
}

impl SubscriptionStatus {
    fn slot(&mut self, latch: Latch) -> &mut bool {
        match latch {
            Latch::AttributesRequested => &mut self.attributes_requested,
            Latch::AttributesSubscribed => &mut self.attributes_subscribed,
            Latch::FirmwareInfoSent => &mut self.firmware_info_sent,
            Latch::FirmwareUpdateSubscribed => &mut self.firmware_update_subscribed,
        }
    }
}

#[derive(Debug, Default)]
pub struct StatusFlags {
    inner: Mutex<SubscriptionStatus>,
}

impl StatusFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SubscriptionStatus {
        *self.lock()
    }

    pub fn is_set(&self, latch: Latch) -> bool {
        *self.lock().slot(latch)
    }

    pub fn latch(&self, latch: Latch) {
        *self.lock().slot(latch) = true;
    }

    pub fn clear(&self, latch: Latch) {
        *self.lock().slot(latch) = false;
    }

    // Plain booleans: a poisoned lock still holds valid data.
    fn lock(&self) -> MutexGuard<'_, SubscriptionStatus> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn latches_are_independent() {
        let flags = StatusFlags::new();
        flags.latch(Latch::AttributesRequested);
        flags.latch(Latch::FirmwareUpdateSubscribed);
        flags.clear(Latch::FirmwareUpdateSubscribed);

        assert_eq!(
            flags.snapshot(),
            SubscriptionStatus {
                attributes_requested: true,
                ..SubscriptionStatus::default()
            }
        );
        assert!(flags.is_set(Latch::AttributesRequested));
        assert!(!flags.is_set(Latch::AttributesSubscribed));
    }
}
