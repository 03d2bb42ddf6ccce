use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::try_join_all;
use parking_lot::Mutex;

use super::FakePeripheral;
use crate::ble::binding::BlePeripheral;
use crate::ble::controller::{BleController, ControllerOptions};
use crate::ble::scanner::{DEFAULT_TIMEOUT_MS, ScanOptions, Scanner};
use crate::error::{BleError, Result};

/// [`FakeScanner`] 记录的调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScannerCall {
    ScanAll(Option<u64>),
    ScanForUuid(String),
    ScanForUuids(Vec<String>),
    ScanForName(String),
    ScanForNames(Vec<String>),
    StopScanning,
}

/// 不经过发现源、直接从预置外设中应答的扫描器
///
/// 没有匹配时立即返回 `ScanTimedOut`，不等待。
#[derive(Default)]
pub struct FakeScanner {
    peripherals: Mutex<Vec<Arc<FakePeripheral>>>,
    calls: Mutex<Vec<ScannerCall>>,
}

impl FakeScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peripheral(&self, peripheral: Arc<FakePeripheral>) {
        self.peripherals.lock().push(peripheral);
    }

    pub fn calls(&self) -> Vec<ScannerCall> {
        self.calls.lock().clone()
    }

    fn record(&self, call: ScannerCall) {
        self.calls.lock().push(call);
    }

    fn matching(&self, uuids: &[String], names: &[String]) -> Vec<Arc<FakePeripheral>> {
        self.peripherals
            .lock()
            .iter()
            .filter(|p| {
                uuids.contains(&p.uuid())
                    || p.local_name()
                        .is_some_and(|name| names.iter().any(|n| name.contains(n.as_str())))
            })
            .cloned()
            .collect()
    }

    async fn answer(
        &self,
        uuids: Vec<String>,
        names: Vec<String>,
        options: ScanOptions,
    ) -> Result<Vec<BleController>> {
        let found = self.matching(&uuids, &names);
        if found.is_empty() {
            return Err(BleError::ScanTimedOut {
                timeout_ms: options.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
                uuids,
                names,
            });
        }

        try_join_all(found.into_iter().map(|peripheral| {
            BleController::create(
                ControllerOptions::new(peripheral)
                    .with_callbacks(options.characteristic_callbacks.clone())
                    .with_rssi_interval_ms(options.rssi_interval_ms),
            )
        }))
        .await
    }
}

#[async_trait]
impl Scanner for FakeScanner {
    async fn scan_all(&self, duration_ms: Option<u64>) -> Result<Vec<Arc<dyn BlePeripheral>>> {
        self.record(ScannerCall::ScanAll(duration_ms));
        Ok(self
            .peripherals
            .lock()
            .iter()
            .map(|p| Arc::clone(p) as Arc<dyn BlePeripheral>)
            .collect())
    }

    async fn scan_for_uuids(
        &self,
        uuids: Vec<String>,
        options: ScanOptions,
    ) -> Result<Vec<BleController>> {
        self.record(ScannerCall::ScanForUuids(uuids.clone()));
        self.answer(uuids, Vec::new(), options).await
    }

    async fn scan_for_names(
        &self,
        names: Vec<String>,
        options: ScanOptions,
    ) -> Result<Vec<BleController>> {
        self.record(ScannerCall::ScanForNames(names.clone()));
        self.answer(Vec::new(), names, options).await
    }

    async fn stop_scanning(&self) -> Result<()> {
        self.record(ScannerCall::StopScanning);
        Ok(())
    }

    async fn scan_for_uuid(&self, uuid: &str, options: ScanOptions) -> Result<BleController> {
        self.record(ScannerCall::ScanForUuid(uuid.to_string()));
        let mut controllers = self.answer(vec![uuid.to_string()], Vec::new(), options).await?;
        Ok(controllers.remove(0))
    }

    async fn scan_for_name(&self, name: &str, options: ScanOptions) -> Result<BleController> {
        self.record(ScannerCall::ScanForName(name.to_string()));
        let mut controllers = self.answer(Vec::new(), vec![name.to_string()], options).await?;
        Ok(controllers.remove(0))
    }
}
