//! 基于 btleplug 的绑定实现
//!
//! 适配器事件流由一个常驻任务读取：发现 / 更新事件转成 [`DiscoverySource`] 的发现推送，
//! 断开事件转成对应外设的 [`PeripheralEvent::Disconnect`]。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures_util::StreamExt;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::ble::binding::{
    BleCharacteristic, BlePeripheral, BleService, CharacteristicProperty, DiscoverySource,
    PeripheralEvent, PeripheralState, ServicesAndCharacteristics,
};
use crate::error::BindingError;

const DISCOVERY_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 64;
const NOTIFICATION_CAPACITY: usize = 256;

/// 本次扫描已推送过的外设：id -> 推送时是否已知名称
#[derive(Default)]
struct ScanSession {
    is_scanning: bool,
    allow_duplicates: bool,
    published: HashMap<String, bool>,
}

impl ScanSession {
    fn should_publish(&mut self, id: &str, has_name: bool) -> bool {
        if !self.is_scanning {
            return false;
        }
        if self.allow_duplicates {
            return true;
        }
        match self.published.get_mut(id) {
            None => {
                self.published.insert(id.to_string(), has_name);
                true
            }
            // 名称第一次出现时再推送一次，按名称扫描依赖它
            Some(had_name) if !*had_name && has_name => {
                *had_name = true;
                true
            }
            Some(_) => false,
        }
    }
}

struct DiscoveryShared {
    peripherals: Mutex<HashMap<PeripheralId, Arc<BtleplugPeripheral>>>,
    session: Mutex<ScanSession>,
    discoveries: broadcast::Sender<Arc<dyn BlePeripheral>>,
}

impl DiscoveryShared {
    async fn wrapper(
        &self,
        adapter: &Adapter,
        id: &PeripheralId,
    ) -> Result<Arc<BtleplugPeripheral>, BindingError> {
        if let Some(existing) = self.peripherals.lock().get(id) {
            return Ok(Arc::clone(existing));
        }

        let peripheral = adapter.peripheral(id).await?;
        let wrapper = Arc::new(BtleplugPeripheral::new(peripheral));
        Ok(Arc::clone(
            self.peripherals
                .lock()
                .entry(id.clone())
                .or_insert(wrapper),
        ))
    }

    async fn on_seen(&self, adapter: &Adapter, id: PeripheralId) {
        let peripheral = match self.wrapper(adapter, &id).await {
            Ok(peripheral) => peripheral,
            Err(err) => {
                debug!("Failed to resolve peripheral {id:?}: {err}");
                return;
            }
        };
        peripheral.refresh_properties().await;

        let has_name = peripheral.local_name().is_some();
        if self.session.lock().should_publish(&peripheral.id, has_name) {
            trace!(
                "Discovered {} ({:?})",
                peripheral.id,
                peripheral.local_name()
            );
            let _ = self.discoveries.send(peripheral);
        }
    }

    fn on_disconnected(&self, id: &PeripheralId) {
        let peripheral = self.peripherals.lock().get(id).cloned();
        if let Some(peripheral) = peripheral {
            peripheral.mark_disconnected();
        }
    }
}

/// 使用第一个可用适配器的发现源
pub struct BtleplugDiscovery {
    adapter: Adapter,
    shared: Arc<DiscoveryShared>,
    pump: JoinHandle<()>,
}

impl BtleplugDiscovery {
    pub async fn new() -> Result<Self, BindingError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(BindingError::NoAdapter)?;
        match adapter.adapter_info().await {
            Ok(adapter_info) => info!("Using Bluetooth adapter: {adapter_info}"),
            Err(err) => debug!("Failed to query adapter info: {err}"),
        }

        let (discoveries, _) = broadcast::channel(DISCOVERY_CAPACITY);
        let shared = Arc::new(DiscoveryShared {
            peripherals: Mutex::new(HashMap::new()),
            session: Mutex::new(ScanSession::default()),
            discoveries,
        });

        let mut events = adapter.events().await?;
        let pump = {
            let adapter = adapter.clone();
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    match event {
                        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                            shared.on_seen(&adapter, id).await;
                        }
                        CentralEvent::DeviceDisconnected(id) => shared.on_disconnected(&id),
                        _ => {}
                    }
                }
                warn!("Adapter event stream ended");
            })
        };

        Ok(Self {
            adapter,
            shared,
            pump,
        })
    }
}

#[async_trait]
impl DiscoverySource for BtleplugDiscovery {
    fn discoveries(&self) -> broadcast::Receiver<Arc<dyn BlePeripheral>> {
        self.shared.discoveries.subscribe()
    }

    async fn start_scanning(
        &self,
        service_uuids: &[String],
        allow_duplicates: bool,
    ) -> Result<(), BindingError> {
        let services = service_uuids
            .iter()
            .map(|s| {
                Uuid::parse_str(s)
                    .map_err(|err| BindingError::Failed(format!("Invalid service uuid {s}: {err}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        *self.shared.session.lock() = ScanSession {
            is_scanning: true,
            allow_duplicates,
            published: HashMap::new(),
        };

        if let Err(err) = self.adapter.start_scan(ScanFilter { services }).await {
            self.shared.session.lock().is_scanning = false;
            return Err(err.into());
        }
        debug!("Adapter scan started");
        Ok(())
    }

    async fn stop_scanning(&self) -> Result<(), BindingError> {
        self.shared.session.lock().is_scanning = false;
        self.adapter.stop_scan().await?;
        debug!("Adapter scan stopped");
        Ok(())
    }
}

impl Drop for BtleplugDiscovery {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

pub struct BtleplugPeripheral {
    peripheral: Peripheral,
    id: String,
    local_name: Mutex<Option<String>>,
    state: Mutex<PeripheralState>,
    events: broadcast::Sender<PeripheralEvent>,
}

impl BtleplugPeripheral {
    fn new(peripheral: Peripheral) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            id: peripheral.id().to_string(),
            peripheral,
            local_name: Mutex::new(None),
            state: Mutex::new(PeripheralState::Disconnected),
            events,
        }
    }

    /// 刷新广播名称，广播里没有名称时保留上一次的
    async fn refresh_properties(&self) {
        match self.peripheral.properties().await {
            Ok(Some(properties)) => {
                if let Some(name) = properties.local_name {
                    *self.local_name.lock() = Some(name);
                }
            }
            Ok(None) => {}
            Err(err) => trace!("Failed to read properties of {}: {err}", self.id),
        }
    }

    /// 置为断开并发出断开事件，已断开时不重复发出
    fn mark_disconnected(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), PeripheralState::Disconnected);
        if previous != PeripheralState::Disconnected {
            let _ = self.events.send(PeripheralEvent::Disconnect);
        }
    }

    fn set_state(&self, state: PeripheralState) {
        *self.state.lock() = state;
    }
}

#[async_trait]
impl BlePeripheral for BtleplugPeripheral {
    fn uuid(&self) -> String {
        self.id.clone()
    }

    fn local_name(&self) -> Option<String> {
        self.local_name.lock().clone()
    }

    fn state(&self) -> PeripheralState {
        *self.state.lock()
    }

    async fn connect(&self) -> Result<(), BindingError> {
        self.set_state(PeripheralState::Connecting);
        match self.peripheral.connect().await {
            Ok(()) => {
                self.set_state(PeripheralState::Connected);
                Ok(())
            }
            Err(err) => {
                self.set_state(PeripheralState::Error);
                Err(err.into())
            }
        }
    }

    async fn disconnect(&self) -> Result<(), BindingError> {
        self.set_state(PeripheralState::Disconnecting);
        match self.peripheral.disconnect().await {
            Ok(()) => {
                self.mark_disconnected();
                Ok(())
            }
            Err(err) => {
                let connected = self.peripheral.is_connected().await.unwrap_or(false);
                self.set_state(if connected {
                    PeripheralState::Connected
                } else {
                    PeripheralState::Error
                });
                Err(err.into())
            }
        }
    }

    async fn discover_services_and_characteristics(
        &self,
    ) -> Result<ServicesAndCharacteristics, BindingError> {
        self.peripheral.discover_services().await?;

        let mut result = ServicesAndCharacteristics::default();
        for service in self.peripheral.services() {
            result.services.push(BleService {
                uuid: service.uuid.to_string(),
                characteristic_uuids: service
                    .characteristics
                    .iter()
                    .map(|c| c.uuid.to_string())
                    .collect(),
            });
            for characteristic in service.characteristics {
                result.characteristics.push(Arc::new(BtleplugCharacteristic::new(
                    self.peripheral.clone(),
                    characteristic,
                )));
            }
        }
        Ok(result)
    }

    async fn update_rssi(&self) -> Result<(), BindingError> {
        let rssi = self
            .peripheral
            .properties()
            .await?
            .and_then(|properties| properties.rssi);
        if let Some(rssi) = rssi {
            let _ = self.events.send(PeripheralEvent::RssiUpdate(rssi));
        }
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<PeripheralEvent> {
        self.events.subscribe()
    }
}

pub struct BtleplugCharacteristic {
    peripheral: Peripheral,
    characteristic: Characteristic,
    notifications: broadcast::Sender<Vec<u8>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugCharacteristic {
    fn new(peripheral: Peripheral, characteristic: Characteristic) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            peripheral,
            characteristic,
            notifications,
            forwarder: Mutex::new(None),
        }
    }
}

#[async_trait]
impl BleCharacteristic for BtleplugCharacteristic {
    fn uuid(&self) -> String {
        self.characteristic.uuid.to_string()
    }

    fn properties(&self) -> Vec<CharacteristicProperty> {
        map_properties(self.characteristic.properties)
    }

    async fn subscribe(&self) -> Result<(), BindingError> {
        self.peripheral.subscribe(&self.characteristic).await?;

        // 外设级别的通知流，按特征 uuid 过滤后转发
        let mut stream = self.peripheral.notifications().await?;
        let uuid = self.characteristic.uuid;
        let notifications = self.notifications.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid == uuid {
                    let _ = notifications.send(notification.value);
                }
            }
        });

        if let Some(previous) = self.forwarder.lock().replace(forwarder) {
            previous.abort();
        }
        Ok(())
    }

    fn notifications(&self) -> broadcast::Receiver<Vec<u8>> {
        self.notifications.subscribe()
    }
}

impl Drop for BtleplugCharacteristic {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.get_mut().take() {
            forwarder.abort();
        }
    }
}

fn map_properties(flags: CharPropFlags) -> Vec<CharacteristicProperty> {
    [
        (CharPropFlags::BROADCAST, CharacteristicProperty::Broadcast),
        (CharPropFlags::READ, CharacteristicProperty::Read),
        (
            CharPropFlags::WRITE_WITHOUT_RESPONSE,
            CharacteristicProperty::WriteWithoutResponse,
        ),
        (CharPropFlags::WRITE, CharacteristicProperty::Write),
        (CharPropFlags::NOTIFY, CharacteristicProperty::Notify),
        (CharPropFlags::INDICATE, CharacteristicProperty::Indicate),
        (
            CharPropFlags::AUTHENTICATED_SIGNED_WRITES,
            CharacteristicProperty::AuthenticatedSignedWrites,
        ),
        (
            CharPropFlags::EXTENDED_PROPERTIES,
            CharacteristicProperty::ExtendedProperties,
        ),
    ]
    .into_iter()
    .filter(|(flag, _)| flags.contains(*flag))
    .map(|(_, property)| property)
    .collect()
}
