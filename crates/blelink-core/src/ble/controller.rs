//! BLE Controller - 管理单个外设的连接生命周期
//!
//! 连接流程 (严格按顺序执行):
//! 1. 重置"主动断开"标记
//! 2. 连接外设
//! 3. 发现全部服务和特征
//! 4. 订阅所有支持 notify 的特征，任一失败即中止
//! 5. 为注册了回调的特征挂接数据监听
//! 6. 启动 RSSI 轮询 (如果配置了间隔) 并监听 RSSI 更新
//! 7. 监听断开事件
//!
//! 非主动断开时会自动重新执行完整的连接流程。重连失败不会传播到任何调用方，
//! 而是记录日志并通过 [`BleController::reconnect_failures`] 发布。

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::ble::binding::{
    BleCharacteristic, BlePeripheral, BleService, PeripheralEvent, display_name,
};
use crate::error::{BleError, Result};

/// 特征数据回调: `(data, characteristic)`
pub type CharacteristicCallback = Arc<dyn Fn(&[u8], &Arc<dyn BleCharacteristic>) + Send + Sync>;

/// 特征 uuid -> 回调
pub type CharacteristicCallbacks = HashMap<String, CharacteristicCallback>;

/// 重连失败通知的缓冲大小
const FAILURE_CHANNEL_CAPACITY: usize = 16;

/// Controller 构造参数
#[derive(Clone)]
pub struct ControllerOptions {
    pub peripheral: Arc<dyn BlePeripheral>,
    pub characteristic_callbacks: CharacteristicCallbacks,
    pub rssi_interval_ms: Option<u64>,
    /// 构造后是否立即连接，默认 `true`
    pub should_connect: bool,
}

impl ControllerOptions {
    pub fn new(peripheral: Arc<dyn BlePeripheral>) -> Self {
        Self {
            peripheral,
            characteristic_callbacks: CharacteristicCallbacks::new(),
            rssi_interval_ms: None,
            should_connect: true,
        }
    }

    pub fn with_callbacks(mut self, callbacks: CharacteristicCallbacks) -> Self {
        self.characteristic_callbacks = callbacks;
        self
    }

    pub fn with_rssi_interval_ms(mut self, rssi_interval_ms: Option<u64>) -> Self {
        self.rssi_interval_ms = rssi_interval_ms;
        self
    }

    pub fn should_connect(mut self, should_connect: bool) -> Self {
        self.should_connect = should_connect;
        self
    }
}

/// 单个外设的会话控制器
///
/// 克隆得到的是同一个控制器的另一个句柄。
#[derive(Clone)]
pub struct BleController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    peripheral: Arc<dyn BlePeripheral>,
    characteristic_callbacks: CharacteristicCallbacks,
    rssi_interval_ms: Option<u64>,
    is_intentional_disconnect: AtomicBool,
    session: Mutex<Session>,
    failures: broadcast::Sender<Arc<BleError>>,
}

/// 一次连接期间的状态和监听句柄
#[derive(Default)]
struct Session {
    services: Vec<BleService>,
    characteristics: Vec<Arc<dyn BleCharacteristic>>,
    rssi_timer: Option<JoinHandle<()>>,
    rssi_listener: Option<JoinHandle<()>>,
    disconnect_listener: Option<(u64, JoinHandle<()>)>,
    data_listeners: Vec<JoinHandle<()>>,
    listener_generation: u64,
}

impl Session {
    fn clear_rssi_interval(&mut self) {
        if let Some(timer) = self.rssi_timer.take() {
            timer.abort();
        }
    }

    fn teardown_rssi_listener(&mut self) {
        if let Some(listener) = self.rssi_listener.take() {
            listener.abort();
        }
    }

    fn teardown_data_listeners(&mut self) {
        for listener in self.data_listeners.drain(..) {
            listener.abort();
        }
    }

    fn teardown_disconnect_listener(&mut self) {
        if let Some((_, listener)) = self.disconnect_listener.take() {
            listener.abort();
        }
    }

    fn teardown_all(&mut self) {
        self.clear_rssi_interval();
        self.teardown_rssi_listener();
        self.teardown_data_listeners();
        self.teardown_disconnect_listener();
    }
}

impl BleController {
    /// 创建控制器，`should_connect` 为 `true` 时立即执行 [`connect`](Self::connect)
    pub async fn create(options: ControllerOptions) -> Result<Self> {
        let ControllerOptions {
            peripheral,
            characteristic_callbacks,
            rssi_interval_ms,
            should_connect,
        } = options;

        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        let controller = Self {
            inner: Arc::new(ControllerInner {
                peripheral,
                characteristic_callbacks,
                rssi_interval_ms,
                is_intentional_disconnect: AtomicBool::new(false),
                session: Mutex::new(Session::default()),
                failures,
            }),
        };

        if should_connect {
            controller.connect().await?;
        }

        Ok(controller)
    }

    /// 连接、发现、订阅，并挂接 RSSI / 断开监听
    pub async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    /// 主动断开
    ///
    /// 外设已处于 disconnected / disconnecting 时不做任何事。
    pub async fn disconnect(&self) -> Result<()> {
        let inner = &self.inner;
        inner.is_intentional_disconnect.store(true, Ordering::SeqCst);

        if inner.peripheral.state().is_disconnected() {
            debug!(
                "Peripheral {} already disconnected, skipping disconnect",
                inner.name_for_log()
            );
            return Ok(());
        }

        info!("Disconnecting from {}", inner.name_for_log());
        inner
            .peripheral
            .disconnect()
            .await
            .map_err(|err| BleError::DeviceDisconnectFailed {
                local_name: inner.name_for_log(),
                original_error: err.to_string(),
            })?;

        inner.session.lock().clear_rssi_interval();
        Ok(())
    }

    /// 按 uuid 查找已发现的特征
    pub fn get_characteristic(&self, uuid: &str) -> Option<Arc<dyn BleCharacteristic>> {
        self.inner
            .session
            .lock()
            .characteristics
            .iter()
            .find(|c| c.uuid() == uuid)
            .cloned()
    }

    pub fn characteristics(&self) -> Vec<Arc<dyn BleCharacteristic>> {
        self.inner.session.lock().characteristics.clone()
    }

    pub fn services(&self) -> Vec<BleService> {
        self.inner.session.lock().services.clone()
    }

    pub fn uuid(&self) -> String {
        self.inner.peripheral.uuid()
    }

    pub fn name(&self) -> Option<String> {
        self.inner.peripheral.local_name()
    }

    pub fn peripheral(&self) -> &Arc<dyn BlePeripheral> {
        &self.inner.peripheral
    }

    pub fn rssi_interval_ms(&self) -> Option<u64> {
        self.inner.rssi_interval_ms
    }

    pub fn is_intentional_disconnect(&self) -> bool {
        self.inner.is_intentional_disconnect.load(Ordering::SeqCst)
    }

    /// 自动重连失败时发布的错误
    pub fn reconnect_failures(&self) -> broadcast::Receiver<Arc<BleError>> {
        self.inner.failures.subscribe()
    }

    /// 两个句柄是否指向同一个控制器
    pub fn ptr_eq(&self, other: &BleController) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for BleController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BleController")
            .field("uuid", &self.uuid())
            .field("name", &self.name())
            .field("rssi_interval_ms", &self.inner.rssi_interval_ms)
            .finish_non_exhaustive()
    }
}

impl ControllerInner {
    fn name_for_log(&self) -> String {
        display_name(self.peripheral.as_ref())
    }

    /// 返回装箱的 future，断开监听任务中会递归调用它
    fn connect(self: &Arc<Self>) -> BoxFuture<'static, Result<()>> {
        let this = Arc::clone(self);
        async move {
            this.is_intentional_disconnect.store(false, Ordering::SeqCst);

            info!("Connecting to {}", this.name_for_log());
            this.peripheral.connect().await?;

            debug!("Discovering services and characteristics...");
            let discovered = this
                .peripheral
                .discover_services_and_characteristics()
                .await?;
            debug!(
                "Found {} services, {} characteristics",
                discovered.services.len(),
                discovered.characteristics.len()
            );

            {
                let mut session = this.session.lock();
                session.teardown_data_listeners();
                session.services = discovered.services;
                session.characteristics = discovered.characteristics.clone();
            }

            for characteristic in &discovered.characteristics {
                if let Err(err) = this.subscribe_if_notifiable(characteristic).await {
                    // 会话不完整，已装好的数据回调不能留在外面
                    this.session.lock().teardown_data_listeners();
                    return Err(err);
                }
            }

            this.setup_rssi_if_enabled();
            this.setup_disconnect_handler();

            info!("Connected to {}", this.name_for_log());
            Ok(())
        }
        .boxed()
    }

    async fn subscribe_if_notifiable(
        &self,
        characteristic: &Arc<dyn BleCharacteristic>,
    ) -> Result<()> {
        if !characteristic.supports_notify() {
            return Ok(());
        }

        let uuid = characteristic.uuid();
        characteristic
            .subscribe()
            .await
            .map_err(|err| BleError::CharacteristicSubscribeFailed {
                characteristic_uuid: uuid.clone(),
                original_error: err.to_string(),
            })?;
        trace!("Subscribed to characteristic {uuid}");

        if let Some(callback) = self.characteristic_callbacks.get(&uuid) {
            let listener = spawn_data_listener(Arc::clone(characteristic), Arc::clone(callback));
            self.session.lock().data_listeners.push(listener);
        }
        Ok(())
    }

    fn setup_rssi_if_enabled(&self) {
        let mut session = self.session.lock();

        if let Some(period) = self
            .rssi_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
        {
            session.clear_rssi_interval();
            let peripheral = Arc::clone(&self.peripheral);
            session.rssi_timer = Some(tokio::spawn(async move {
                let mut ticker = time::interval_at(Instant::now() + period, period);
                loop {
                    ticker.tick().await;
                    if let Err(err) = peripheral.update_rssi().await {
                        debug!("RSSI refresh failed: {err}");
                    }
                }
            }));
        }

        session.teardown_rssi_listener();
        let mut events = self.peripheral.events();
        let peripheral = Arc::clone(&self.peripheral);
        session.rssi_listener = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(PeripheralEvent::RssiUpdate(rssi)) => {
                        info!("RSSI ({}): {}", display_name(peripheral.as_ref()), rssi);
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        }));
    }

    fn setup_disconnect_handler(self: &Arc<Self>) {
        let mut session = self.session.lock();
        session.teardown_disconnect_listener();
        session.listener_generation += 1;
        let generation = session.listener_generation;

        let mut events = self.peripheral.events();
        let controller = Arc::downgrade(self);
        let listener = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(PeripheralEvent::Disconnect) => break,
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Missed {skipped} peripheral events");
                    }
                    Err(RecvError::Closed) => return,
                }
            }
            drop(events);
            handle_disconnect(controller, generation).await;
        });
        session.disconnect_listener = Some((generation, listener));
    }
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        self.session.get_mut().teardown_all();
    }
}

fn spawn_data_listener(
    characteristic: Arc<dyn BleCharacteristic>,
    callback: CharacteristicCallback,
) -> JoinHandle<()> {
    let mut notifications = characteristic.notifications();
    tokio::spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(data) => callback(&data, &characteristic),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        "Dropped {skipped} notifications from characteristic {}",
                        characteristic.uuid()
                    );
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// 断开事件处理：清理本次会话的监听，非主动断开时自动重连
async fn handle_disconnect(controller: Weak<ControllerInner>, generation: u64) {
    let Some(inner) = controller.upgrade() else {
        return;
    };

    {
        let mut session = inner.session.lock();
        if !matches!(session.disconnect_listener, Some((current, _)) if current == generation) {
            trace!("Ignoring disconnect from a stale listener");
            return;
        }
        session.clear_rssi_interval();
        session.teardown_rssi_listener();
        session.teardown_data_listeners();
        // 当前任务自身，只分离不 abort
        session.disconnect_listener = None;
    }

    let name = inner.name_for_log();
    if inner.is_intentional_disconnect.load(Ordering::SeqCst) {
        info!("Disconnected from {name}");
        return;
    }

    warn!("Unexpectedly disconnected from {name}!");
    info!("Reconnecting to {name}...");
    match inner.connect().await {
        Ok(()) => info!("Reconnected to {name}!"),
        Err(err) => {
            error!("Failed to reconnect to {name}: {}", err.friendly_message());
            let _ = inner.failures.send(Arc::new(err));
        }
    }
}
