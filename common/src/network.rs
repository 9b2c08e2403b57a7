use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use log::{info, warn};

use crate::{
    config::WifiConfig,
    types::{LinkInfo, LinkState},
};

/// Station-mode radio driver.
pub trait WifiLink {
    /// Starts an association attempt without waiting for it.
    fn begin(&mut self, ssid: &str, password: &str);
    fn is_connected(&self) -> bool;
    fn disconnect(&mut self);
    fn info(&self) -> LinkInfo;
}

/// Read-only view of the link for the other activities.
#[derive(Debug, Clone, Default)]
pub struct LinkMonitor {
    state: Arc<AtomicU8>,
    info: Arc<Mutex<LinkInfo>>,
}

impl LinkMonitor {
    pub fn state(&self) -> LinkState {
        LinkState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn is_up(&self) -> bool {
        self.state() == LinkState::Connected
    }

    pub fn info(&self) -> LinkInfo {
        self.info
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn publish(&self, state: LinkState, info: Option<LinkInfo>) {
        self.state.store(state.to_raw(), Ordering::Release);
        if let Some(info) = info {
            *self.info.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = info;
        }
    }
}

pub struct NetworkSession<L> {
    link: L,
    config: WifiConfig,
    state: LinkState,
    last_attempt_ms: Option<u64>,
    last_attempt_polls: u32,
    monitor: LinkMonitor,
}

impl<L: WifiLink> NetworkSession<L> {
    pub fn new(link: L, config: WifiConfig) -> Self {
        Self {
            link,
            config,
            state: LinkState::Disconnected,
            last_attempt_ms: None,
            last_attempt_polls: 0,
            monitor: LinkMonitor::default(),
        }
    }

    pub fn monitor(&self) -> LinkMonitor {
        self.monitor.clone()
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn last_attempt_ms(&self) -> Option<u64> {
        self.last_attempt_ms
    }

    /// Status polls the last connection attempt needed (or used up).
    pub fn last_attempt_polls(&self) -> u32 {
        self.last_attempt_polls
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    /// Makes sure the station is associated, running at most one bounded
    /// attempt. Never fails hard: `false` means "try again next cycle".
    pub fn ensure_connected(&mut self, now_ms: u64) -> bool {
        if self.link.is_connected() {
            if self.state != LinkState::Connected {
                self.set_state(LinkState::Connected);
            } else {
                self.monitor.publish(LinkState::Connected, Some(self.link.info()));
            }
            return true;
        }

        if self.state == LinkState::Connected {
            warn!("wifi connection lost, reconnecting");
        }
        self.set_state(LinkState::Connecting);
        self.last_attempt_ms = Some(now_ms);
        self.last_attempt_polls = 0;

        self.link.disconnect();
        pause(self.config.settle_ms);

        info!("connecting to wifi `{}`", self.config.ssid);
        self.link.begin(&self.config.ssid, &self.config.password);

        let attempts = self.config.connect_attempts;
        for attempt in 1..=attempts {
            pause(self.config.retry_delay_ms);
            self.last_attempt_polls = attempt;

            if self.link.is_connected() {
                let info = self.link.info();
                info!(
                    "wifi connected on attempt {attempt}/{attempts}, ip {}",
                    info.local_ip
                );
                self.set_state(LinkState::Connected);
                return true;
            }
        }

        warn!("wifi not connected after {attempts} attempts; will retry later");
        self.set_state(LinkState::Disconnected);
        false
    }

    fn set_state(&mut self, state: LinkState) {
        self.state = state;
        let info = (state == LinkState::Connected).then(|| self.link.info());
        self.monitor.publish(state, info);
    }
}

fn pause(ms: u64) {
    if ms > 0 {
        thread::sleep(Duration::from_millis(ms));
    }
}
