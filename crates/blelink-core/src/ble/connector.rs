//! BLE Connector - 查找并保持单个目标设备
//!
//! 有 `device_uuid` 时走 `scan_for_uuid` 快速路径，否则按名称子串扫描。
//! 已持有 Controller 时 `connect_ble` 直接返回，不会再次扫描。

use std::sync::Arc;

use log::{debug, info};
use tokio::sync::Mutex;

use crate::ble::binding::DiscoverySource;
use crate::ble::controller::BleController;
use crate::ble::scanner::{BleScanner, ScanOptions, Scanner, ScannerOptions};
use crate::error::{BleError, Result};

/// Connector 构造参数
#[derive(Debug, Clone)]
pub struct ConnectorOptions {
    pub scanner_options: ScannerOptions,
    pub scan_options: ScanOptions,
    pub device_local_name: String,
    pub device_uuid: Option<String>,
    /// 构造时是否立即 `connect_ble`，默认 `true`
    pub connect_ble_on_create: bool,
}

impl ConnectorOptions {
    pub fn new(device_local_name: impl Into<String>) -> Self {
        Self {
            scanner_options: ScannerOptions::default(),
            scan_options: ScanOptions::default(),
            device_local_name: device_local_name.into(),
            device_uuid: None,
            connect_ble_on_create: true,
        }
    }

    pub fn with_device_uuid(mut self, device_uuid: Option<String>) -> Self {
        self.device_uuid = device_uuid;
        self
    }

    pub fn with_scan_options(mut self, scan_options: ScanOptions) -> Self {
        self.scan_options = scan_options;
        self
    }

    pub fn with_scanner_options(mut self, scanner_options: ScannerOptions) -> Self {
        self.scanner_options = scanner_options;
        self
    }

    pub fn connect_ble_on_create(mut self, connect: bool) -> Self {
        self.connect_ble_on_create = connect;
        self
    }
}

pub struct BleConnector {
    scanner: Arc<dyn Scanner>,
    scan_options: ScanOptions,
    device_local_name: String,
    device_uuid: Option<String>,
    // 异步锁：连接过程中持有，保证同一时刻只有一次扫描
    controller: Mutex<Option<BleController>>,
}

impl BleConnector {
    /// 基于发现源创建内部 [`BleScanner`]
    pub async fn create(
        source: Arc<dyn DiscoverySource>,
        options: ConnectorOptions,
    ) -> Result<Self> {
        let scanner = Arc::new(BleScanner::new(source, options.scanner_options));
        Self::with_scanner(scanner, options).await
    }

    /// 使用外部提供的扫描器
    pub async fn with_scanner(
        scanner: Arc<dyn Scanner>,
        options: ConnectorOptions,
    ) -> Result<Self> {
        let ConnectorOptions {
            scan_options,
            device_local_name,
            device_uuid,
            connect_ble_on_create,
            ..
        } = options;

        let connector = Self {
            scanner,
            scan_options,
            device_local_name,
            device_uuid,
            controller: Mutex::new(None),
        };

        if connect_ble_on_create {
            connector.connect_ble().await?;
        }
        Ok(connector)
    }

    /// 扫描并连接目标设备，已连接时返回现有 Controller
    pub async fn connect_ble(&self) -> Result<BleController> {
        let mut slot = self.controller.lock().await;
        if let Some(controller) = slot.as_ref() {
            debug!("Already holding a controller for {}", controller.uuid());
            return Ok(controller.clone());
        }

        let controller = match &self.device_uuid {
            Some(uuid) => {
                info!("Scanning for device uuid {uuid}");
                self.scanner
                    .scan_for_uuid(uuid, self.scan_options.clone())
                    .await?
            }
            None => {
                info!("Scanning for device name \"{}\"", self.device_local_name);
                self.scanner
                    .scan_for_name(&self.device_local_name, self.scan_options.clone())
                    .await?
            }
        };

        *slot = Some(controller.clone());
        Ok(controller)
    }

    /// 主动断开当前设备
    pub async fn disconnect_ble(&self) -> Result<()> {
        let controller = self
            .controller
            .lock()
            .await
            .clone()
            .ok_or(BleError::NotConnected)?;
        controller.disconnect().await
    }

    pub async fn get_ble_controller(&self) -> Option<BleController> {
        self.controller.lock().await.clone()
    }

    pub fn device_local_name(&self) -> &str {
        &self.device_local_name
    }

    pub fn device_uuid(&self) -> Option<&str> {
        self.device_uuid.as_deref()
    }

    pub fn scanner(&self) -> &Arc<dyn Scanner> {
        &self.scanner
    }
}
