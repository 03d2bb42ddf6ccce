//! Blelink Core Library
//!
//! BLE 外设的扫描、连接和自动重连
//!
//! # 模块
//!
//! - **ble**: 绑定接口、Scanner、Controller、Connector 以及 btleplug 实现
//! - **error**: 对外错误类型和错误代码
//! - **config**: 持久化设置
//! - **logging**: 日志级别
//! - **testing**: 不依赖硬件的测试替身
//!
//! # 使用示例
//!
//! ## 扫描并连接
//!
//! ```ignore
//! use blelink_core::{BleScanner, BtleplugDiscovery, ScanOptions, Scanner, ScannerOptions};
//!
//! let source = Arc::new(BtleplugDiscovery::new().await?);
//! let scanner = BleScanner::new(source, ScannerOptions::default());
//!
//! // 找到全部 uuid 或超时
//! let controllers = scanner
//!     .scan_for_uuids(vec![uuid_a, uuid_b], ScanOptions::default())
//!     .await?;
//! ```
//!
//! ## 保持单个设备
//!
//! ```ignore
//! use blelink_core::{BleConnector, ConnectorOptions};
//!
//! let connector = BleConnector::create(source, ConnectorOptions::new("Headset")).await?;
//! let controller = connector.connect_ble().await?; // 已连接时不会再次扫描
//! connector.disconnect_ble().await?;
//! ```

pub mod ble;
pub mod config;
pub mod error;
pub mod logging;
pub mod testing;

pub use ble::{
    BleCharacteristic, BleConnector, BleController, BlePeripheral, BleScanner, BleService,
    BtleplugDiscovery, CharacteristicCallback, CharacteristicCallbacks, CharacteristicProperty,
    ConnectorOptions, ControllerOptions, DiscoverySource, PeripheralEvent, PeripheralState,
    ScanOptions, Scanner, ScannerOptions,
};
pub use config::BleSettings;
pub use error::{BindingError, BleError, Result};
pub use logging::LogLevel;
