use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Fixed-capacity buffer of the most recent samples of one metric.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    capacity: usize,
    samples: VecDeque<f64>,
}

impl SlidingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    pub fn latest(&self) -> Option<f64> {
        self.samples.back().copied()
    }

    /// True only once the window is full and every sample is strictly below `threshold`.
    pub fn is_consistently_below(&self, threshold: f64) -> bool {
        self.is_full() && self.samples.iter().all(|v| *v < threshold)
    }

    /// True only once the window is full and every sample is strictly above `threshold`.
    pub fn is_consistently_above(&self, threshold: f64) -> bool {
        self.is_full() && self.samples.iter().all(|v| *v > threshold)
    }
}

/// Windows and firing latches of one device.
#[derive(Debug, Clone)]
pub struct DeviceWindows {
    pub rssi: SlidingWindow,
    pub latency: SlidingWindow,
    pub rssi_fired: bool,
    pub latency_fired: bool,
}

impl DeviceWindows {
    pub fn new(rssi_window: usize, latency_window: usize) -> Self {
        Self {
            rssi: SlidingWindow::new(rssi_window),
            latency: SlidingWindow::new(latency_window),
            rssi_fired: false,
            latency_fired: false,
        }
    }
}

/// Per-device window state; each device is locked independently.
#[derive(Default)]
pub struct WindowRegistry {
    devices: DashMap<String, Arc<Mutex<DeviceWindows>>>,
}

impl WindowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, device_id: &str, rssi_window: usize, latency_window: usize) -> Arc<Mutex<DeviceWindows>> {
        if let Some(existing) = self.devices.get(device_id) {
            return existing.clone();
        }
        self.devices
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(DeviceWindows::new(rssi_window, latency_window))))
            .clone()
    }

    pub fn remove(&self, device_id: &str) -> bool {
        self.devices.remove(device_id).is_some()
    }

    pub fn clear(&self) {
        self.devices.clear();
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
