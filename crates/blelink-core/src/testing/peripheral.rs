use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::ble::binding::{
    BleCharacteristic, BlePeripheral, BleService, CharacteristicProperty, PeripheralEvent,
    PeripheralState, ServicesAndCharacteristics,
};
use crate::error::BindingError;

const EVENT_CAPACITY: usize = 64;

/// 服务发现时把所有特征归到这个服务下
pub const FAKE_SERVICE_UUID: &str = "fff0";

/// 内存中的外设
///
/// `connect` 置为 connected，`disconnect` 置为 disconnected 并发出断开事件，
/// 与真实外设的行为一致。
pub struct FakePeripheral {
    uuid: String,
    local_name: Mutex<Option<String>>,
    state: Mutex<PeripheralState>,
    rssi: Mutex<i16>,
    characteristics: Mutex<Vec<Arc<FakeCharacteristic>>>,
    connect_failure: Mutex<Option<String>>,
    disconnect_failure: Mutex<Option<String>>,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    discover_calls: AtomicUsize,
    update_rssi_calls: AtomicUsize,
    events: broadcast::Sender<PeripheralEvent>,
}

impl FakePeripheral {
    pub fn new(uuid: &str, local_name: Option<&str>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            uuid: uuid.to_string(),
            local_name: Mutex::new(local_name.map(str::to_string)),
            state: Mutex::new(PeripheralState::Disconnected),
            rssi: Mutex::new(-60),
            characteristics: Mutex::new(Vec::new()),
            connect_failure: Mutex::new(None),
            disconnect_failure: Mutex::new(None),
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            discover_calls: AtomicUsize::new(0),
            update_rssi_calls: AtomicUsize::new(0),
            events,
        }
    }

    pub fn set_characteristics(&self, characteristics: Vec<Arc<FakeCharacteristic>>) {
        *self.characteristics.lock() = characteristics;
    }

    pub fn set_local_name(&self, local_name: Option<&str>) {
        *self.local_name.lock() = local_name.map(str::to_string);
    }

    pub fn set_state(&self, state: PeripheralState) {
        *self.state.lock() = state;
    }

    /// 之后的 `connect` 调用都会失败
    pub fn fail_connect(&self, message: &str) {
        *self.connect_failure.lock() = Some(message.to_string());
    }

    /// 之后的 `disconnect` 调用都会失败
    pub fn fail_disconnect(&self, message: &str) {
        *self.disconnect_failure.lock() = Some(message.to_string());
    }

    /// 模拟链路意外断开
    pub fn simulate_disconnect(&self) {
        self.set_state(PeripheralState::Disconnected);
        let _ = self.events.send(PeripheralEvent::Disconnect);
    }

    /// 模拟一次 RSSI 更新，同时作为之后 `update_rssi` 的返回值
    pub fn simulate_rssi(&self, rssi: i16) {
        *self.rssi.lock() = rssi;
        let _ = self.events.send(PeripheralEvent::RssiUpdate(rssi));
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn discover_calls(&self) -> usize {
        self.discover_calls.load(Ordering::SeqCst)
    }

    pub fn update_rssi_calls(&self) -> usize {
        self.update_rssi_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlePeripheral for FakePeripheral {
    fn uuid(&self) -> String {
        self.uuid.clone()
    }

    fn local_name(&self) -> Option<String> {
        self.local_name.lock().clone()
    }

    fn state(&self) -> PeripheralState {
        *self.state.lock()
    }

    async fn connect(&self) -> Result<(), BindingError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.connect_failure.lock().clone() {
            self.set_state(PeripheralState::Error);
            return Err(BindingError::Failed(message));
        }
        self.set_state(PeripheralState::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BindingError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.disconnect_failure.lock().clone() {
            return Err(BindingError::Failed(message));
        }
        self.set_state(PeripheralState::Disconnected);
        let _ = self.events.send(PeripheralEvent::Disconnect);
        Ok(())
    }

    async fn discover_services_and_characteristics(
        &self,
    ) -> Result<ServicesAndCharacteristics, BindingError> {
        self.discover_calls.fetch_add(1, Ordering::SeqCst);
        let characteristics = self.characteristics.lock().clone();

        let services = if characteristics.is_empty() {
            Vec::new()
        } else {
            vec![BleService {
                uuid: FAKE_SERVICE_UUID.to_string(),
                characteristic_uuids: characteristics.iter().map(|c| c.uuid.clone()).collect(),
            }]
        };

        Ok(ServicesAndCharacteristics {
            services,
            characteristics: characteristics
                .into_iter()
                .map(|c| c as Arc<dyn BleCharacteristic>)
                .collect(),
        })
    }

    async fn update_rssi(&self) -> Result<(), BindingError> {
        self.update_rssi_calls.fetch_add(1, Ordering::SeqCst);
        let rssi = *self.rssi.lock();
        let _ = self.events.send(PeripheralEvent::RssiUpdate(rssi));
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<PeripheralEvent> {
        self.events.subscribe()
    }
}

/// 内存中的特征
pub struct FakeCharacteristic {
    uuid: String,
    properties: Vec<CharacteristicProperty>,
    subscribe_failure: Mutex<Option<String>>,
    subscribe_calls: AtomicUsize,
    notifications: broadcast::Sender<Vec<u8>>,
}

impl FakeCharacteristic {
    pub fn new(uuid: &str, properties: Vec<CharacteristicProperty>) -> Self {
        let (notifications, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            uuid: uuid.to_string(),
            properties,
            subscribe_failure: Mutex::new(None),
            subscribe_calls: AtomicUsize::new(0),
            notifications,
        }
    }

    pub fn notifiable(uuid: &str) -> Self {
        Self::new(
            uuid,
            vec![CharacteristicProperty::Read, CharacteristicProperty::Notify],
        )
    }

    /// 之后的 `subscribe` 调用都会失败
    pub fn fail_subscribe(&self, message: &str) {
        *self.subscribe_failure.lock() = Some(message.to_string());
    }

    /// 推送一条通知数据，没有监听者时直接丢弃
    pub fn simulate_data(&self, data: &[u8]) {
        let _ = self.notifications.send(data.to_vec());
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BleCharacteristic for FakeCharacteristic {
    fn uuid(&self) -> String {
        self.uuid.clone()
    }

    fn properties(&self) -> Vec<CharacteristicProperty> {
        self.properties.clone()
    }

    async fn subscribe(&self) -> Result<(), BindingError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        match self.subscribe_failure.lock().clone() {
            Some(message) => Err(BindingError::Failed(message)),
            None => Ok(()),
        }
    }

    fn notifications(&self) -> broadcast::Receiver<Vec<u8>> {
        self.notifications.subscribe()
    }
}
