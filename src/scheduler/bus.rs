//! The shared measurement hardware.

use crate::hardware::{FlaCommunicator, OpticalSwitch};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// Switch + instrument pair, and the lock that makes one task's
/// route-then-measure sequence a single critical section.
pub struct DeviceBus {
    switch: Arc<dyn OpticalSwitch>,
    fla: Arc<dyn FlaCommunicator>,
    lock: Mutex<()>,
}

impl DeviceBus {
    /// Bus over a switch and an instrument.
    pub fn new(switch: Arc<dyn OpticalSwitch>, fla: Arc<dyn FlaCommunicator>) -> Self {
        Self {
            switch,
            fla,
            lock: Mutex::new(()),
        }
    }

    /// Wait for exclusive use of the hardware. Released when the guard drops.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    /// The optical switch. Callers hold [`DeviceBus::lock`] while using it.
    pub fn switch(&self) -> &dyn OpticalSwitch {
        self.switch.as_ref()
    }

    /// The instrument. Callers hold [`DeviceBus::lock`] while using it.
    pub fn fla(&self) -> &dyn FlaCommunicator {
        self.fla.as_ref()
    }

    /// Outputs a task may be submitted for.
    pub fn supported_channels(&self) -> &BTreeSet<u32> {
        self.switch.supported_output_channels()
    }
}

impl std::fmt::Debug for DeviceBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBus")
            .field("channels", self.supported_channels())
            .field("current", &self.switch.current_output_channel())
            .finish()
    }
}
