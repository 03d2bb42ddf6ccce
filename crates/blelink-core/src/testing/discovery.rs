use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::FakePeripheral;
use crate::ble::binding::{BlePeripheral, DiscoverySource};
use crate::error::BindingError;

const DISCOVERY_CAPACITY: usize = 64;

/// 一次 `start_scanning` 调用的参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartScanningCall {
    pub service_uuids: Vec<String>,
    pub allow_duplicates: bool,
}

/// 内存中的发现源
///
/// 每次 `start_scanning` 都会按添加顺序推送全部已添加的外设，
/// [`discover`](Self::discover) 可在扫描过程中追加推送。
pub struct FakeDiscovery {
    peripherals: Mutex<Vec<Arc<FakePeripheral>>>,
    start_scanning_calls: Mutex<Vec<StartScanningCall>>,
    start_failure: Mutex<Option<String>>,
    stop_scanning_calls: AtomicUsize,
    discovery_subscriptions: AtomicUsize,
    discoveries: broadcast::Sender<Arc<dyn BlePeripheral>>,
}

impl Default for FakeDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDiscovery {
    pub fn new() -> Self {
        let (discoveries, _) = broadcast::channel(DISCOVERY_CAPACITY);
        Self {
            peripherals: Mutex::new(Vec::new()),
            start_scanning_calls: Mutex::new(Vec::new()),
            start_failure: Mutex::new(None),
            stop_scanning_calls: AtomicUsize::new(0),
            discovery_subscriptions: AtomicUsize::new(0),
            discoveries,
        }
    }

    pub fn add_peripheral(&self, peripheral: Arc<FakePeripheral>) {
        self.peripherals.lock().push(peripheral);
    }

    pub fn peripheral(&self, uuid: &str) -> Option<Arc<FakePeripheral>> {
        self.peripherals
            .lock()
            .iter()
            .find(|p| p.uuid() == uuid)
            .cloned()
    }

    /// 立即推送一个发现事件
    pub fn discover(&self, peripheral: Arc<FakePeripheral>) {
        let _ = self.discoveries.send(peripheral);
    }

    pub fn fail_start_scanning(&self, message: &str) {
        *self.start_failure.lock() = Some(message.to_string());
    }

    pub fn start_scanning_calls(&self) -> Vec<StartScanningCall> {
        self.start_scanning_calls.lock().clone()
    }

    pub fn stop_scanning_calls(&self) -> usize {
        self.stop_scanning_calls.load(Ordering::SeqCst)
    }

    /// `discoveries()` 被调用的次数，即安装过的发现监听数
    pub fn discovery_subscriptions(&self) -> usize {
        self.discovery_subscriptions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiscoverySource for FakeDiscovery {
    fn discoveries(&self) -> broadcast::Receiver<Arc<dyn BlePeripheral>> {
        self.discovery_subscriptions.fetch_add(1, Ordering::SeqCst);
        self.discoveries.subscribe()
    }

    async fn start_scanning(
        &self,
        service_uuids: &[String],
        allow_duplicates: bool,
    ) -> Result<(), BindingError> {
        self.start_scanning_calls.lock().push(StartScanningCall {
            service_uuids: service_uuids.to_vec(),
            allow_duplicates,
        });
        if let Some(message) = self.start_failure.lock().clone() {
            return Err(BindingError::Failed(message));
        }

        let peripherals = self.peripherals.lock().clone();
        for peripheral in peripherals {
            let _ = self.discoveries.send(peripheral);
        }
        Ok(())
    }

    async fn stop_scanning(&self) -> Result<(), BindingError> {
        self.stop_scanning_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
