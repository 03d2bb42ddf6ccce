//! BLE 绑定接口
//!
//! Scanner / Controller 只通过这些 trait 与底层蓝牙栈交互。
//! 真实实现见 [`crate::ble::platform`]，测试替身见 [`crate::testing`]。
//!
//! 事件通过 `tokio::sync::broadcast` 分发：订阅方在注册时同步拿到
//! `Receiver`，之后由自己的监听任务消费，移除监听即终止该任务。

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::BindingError;

/// 外设连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeripheralState {
    Error,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl PeripheralState {
    /// `disconnected` 或 `disconnecting`
    pub fn is_disconnected(self) -> bool {
        matches!(
            self,
            PeripheralState::Disconnected | PeripheralState::Disconnecting
        )
    }
}

/// 外设事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeripheralEvent {
    RssiUpdate(i16),
    Disconnect,
}

/// 特征属性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicProperty {
    Broadcast,
    Read,
    WriteWithoutResponse,
    Write,
    Notify,
    Indicate,
    AuthenticatedSignedWrites,
    ExtendedProperties,
}

impl CharacteristicProperty {
    pub fn as_str(self) -> &'static str {
        match self {
            CharacteristicProperty::Broadcast => "broadcast",
            CharacteristicProperty::Read => "read",
            CharacteristicProperty::WriteWithoutResponse => "writeWithoutResponse",
            CharacteristicProperty::Write => "write",
            CharacteristicProperty::Notify => "notify",
            CharacteristicProperty::Indicate => "indicate",
            CharacteristicProperty::AuthenticatedSignedWrites => "authenticatedSignedWrites",
            CharacteristicProperty::ExtendedProperties => "extendedProperties",
        }
    }
}

impl fmt::Display for CharacteristicProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BleService {
    pub uuid: String,
    pub characteristic_uuids: Vec<String>,
}

/// `discover_services_and_characteristics` 的结果
#[derive(Clone, Default)]
pub struct ServicesAndCharacteristics {
    pub services: Vec<BleService>,
    pub characteristics: Vec<Arc<dyn BleCharacteristic>>,
}

impl fmt::Debug for ServicesAndCharacteristics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let uuids: Vec<String> = self.characteristics.iter().map(|c| c.uuid()).collect();
        f.debug_struct("ServicesAndCharacteristics")
            .field("services", &self.services)
            .field("characteristics", &uuids)
            .finish()
    }
}

/// 外设上的一个特征
#[async_trait]
pub trait BleCharacteristic: Send + Sync {
    fn uuid(&self) -> String;

    fn properties(&self) -> Vec<CharacteristicProperty>;

    fn supports_notify(&self) -> bool {
        self.properties().contains(&CharacteristicProperty::Notify)
    }

    /// 开启通知
    async fn subscribe(&self) -> Result<(), BindingError>;

    /// 订阅收到的数据（"data" 事件）
    fn notifications(&self) -> broadcast::Receiver<Vec<u8>>;
}

/// 一个已发现的外设
#[async_trait]
pub trait BlePeripheral: Send + Sync {
    /// 稳定的硬件标识
    fn uuid(&self) -> String;

    /// 广播中的本地名称，可能缺失，也可能在多次广播之间变化
    fn local_name(&self) -> Option<String>;

    fn state(&self) -> PeripheralState;

    async fn connect(&self) -> Result<(), BindingError>;

    async fn disconnect(&self) -> Result<(), BindingError>;

    async fn discover_services_and_characteristics(
        &self,
    ) -> Result<ServicesAndCharacteristics, BindingError>;

    /// 请求刷新信号强度，结果以 [`PeripheralEvent::RssiUpdate`] 送达
    async fn update_rssi(&self) -> Result<(), BindingError>;

    /// 订阅外设事件（rssiUpdate / disconnect）
    fn events(&self) -> broadcast::Receiver<PeripheralEvent>;
}

/// 全局发现源（适配器）
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// 扫描期间每发现一个外设推送一次
    fn discoveries(&self) -> broadcast::Receiver<Arc<dyn BlePeripheral>>;

    async fn start_scanning(
        &self,
        service_uuids: &[String],
        allow_duplicates: bool,
    ) -> Result<(), BindingError>;

    async fn stop_scanning(&self) -> Result<(), BindingError>;
}

/// 日志中使用的外设名称，缺失时退回 uuid
pub fn display_name(peripheral: &dyn BlePeripheral) -> String {
    peripheral
        .local_name()
        .unwrap_or_else(|| peripheral.uuid())
}
