//! BLE Scanner - 按 uuid / 名称发现外设
//!
//! 构造时在发现源上安装一个常驻监听任务，整个 Scanner 生命周期内只安装一次。
//! 每次扫描调用都会重置扫描目标：
//!
//! - uuid 列表：精确匹配 ("快速路径")
//! - 名称列表：广播名称包含任一目标子串即匹配
//! - 两者都为空：收集所有外设，直到固定时长结束 (`scan_all`)
//!
//! 有界扫描用 `tokio::select!` 在"扫描完成"和"超时"之间竞速，先完成者决定结果，
//! 另一方直接被丢弃。
//!
//! 每次扫描有一个递增的代号。新扫描会取代进行中的扫描：被取代的 `scan_all`
//! 立即以已发现的外设返回，被取代的有界扫描只能等自己超时。过期扫描的超时
//! 不会再改动新扫描的状态，也不会停止底层扫描。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::try_join_all;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time;

use crate::ble::binding::{BlePeripheral, DiscoverySource};
use crate::ble::controller::{BleController, CharacteristicCallbacks, ControllerOptions};
use crate::error::{BleError, Result};

pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_DURATION_MS: u64 = 10_000;

/// Scanner 构造参数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScannerOptions {
    pub default_timeout_ms: Option<u64>,
    pub default_duration_ms: Option<u64>,
}

/// 单次扫描参数，会原样传给为匹配外设创建的 Controller
#[derive(Clone, Default)]
pub struct ScanOptions {
    pub characteristic_callbacks: CharacteristicCallbacks,
    pub rssi_interval_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
}

impl ScanOptions {
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

impl std::fmt::Debug for ScanOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut callback_uuids: Vec<&String> = self.characteristic_callbacks.keys().collect();
        callback_uuids.sort();
        f.debug_struct("ScanOptions")
            .field("characteristic_callbacks", &callback_uuids)
            .field("rssi_interval_ms", &self.rssi_interval_ms)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

/// 扫描接口
///
/// 单数形式的方法是复数形式的简写，返回第一个结果。
#[async_trait]
pub trait Scanner: Send + Sync {
    /// 扫描固定时长并返回期间发现的所有外设，到期不会报错
    async fn scan_all(&self, duration_ms: Option<u64>) -> Result<Vec<Arc<dyn BlePeripheral>>>;

    async fn scan_for_uuids(
        &self,
        uuids: Vec<String>,
        options: ScanOptions,
    ) -> Result<Vec<BleController>>;

    async fn scan_for_names(
        &self,
        names: Vec<String>,
        options: ScanOptions,
    ) -> Result<Vec<BleController>>;

    async fn stop_scanning(&self) -> Result<()>;

    async fn scan_for_uuid(&self, uuid: &str, options: ScanOptions) -> Result<BleController> {
        let uuids = vec![uuid.to_string()];
        first_controller(self.scan_for_uuids(uuids.clone(), options).await?, uuids, Vec::new())
    }

    async fn scan_for_name(&self, name: &str, options: ScanOptions) -> Result<BleController> {
        let names = vec![name.to_string()];
        first_controller(self.scan_for_names(names.clone(), options).await?, Vec::new(), names)
    }
}

fn first_controller(
    controllers: Vec<BleController>,
    uuids: Vec<String>,
    names: Vec<String>,
) -> Result<BleController> {
    controllers
        .into_iter()
        .next()
        .ok_or(BleError::NoMatch { uuids, names })
}

/// 当前扫描目标和结果
#[derive(Default)]
struct ScanTarget {
    uuids: Vec<String>,
    names: Vec<String>,
    peripherals: Vec<Arc<dyn BlePeripheral>>,
    is_scanning: bool,
    generation: u64,
    completion: Option<oneshot::Sender<Vec<Arc<dyn BlePeripheral>>>>,
}

impl ScanTarget {
    fn should_return_all(&self) -> bool {
        self.uuids.is_empty() && self.names.is_empty()
    }

    fn is_target(&self, uuid: &str, local_name: Option<&str>) -> bool {
        self.uuids.iter().any(|u| u == uuid)
            || local_name.is_some_and(|name| self.names.iter().any(|n| name.contains(n.as_str())))
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    fn is_done(&self) -> bool {
        let all_uuids_found = !self.uuids.is_empty() && self.uuids.len() == self.peripherals.len();
        let all_names_found = !self.names.is_empty() && self.names.len() == self.peripherals.len();
        all_uuids_found || all_names_found
    }

    /// 处理一个发现事件，返回是否已满足完成条件
    fn handle_discovery(&mut self, peripheral: Arc<dyn BlePeripheral>) -> bool {
        if !self.is_scanning {
            return false;
        }

        let uuid = peripheral.uuid();
        if self.peripherals.iter().any(|p| p.uuid() == uuid) {
            return false;
        }

        let local_name = peripheral.local_name();
        if !self.should_return_all() && !self.is_target(&uuid, local_name.as_deref()) {
            trace!("Ignoring peripheral {uuid} ({local_name:?})");
            return false;
        }

        debug!("Matched peripheral: uuid={uuid}, name={local_name:?}");
        self.peripherals.push(peripheral);
        self.is_done()
    }
}

/// 基于 [`DiscoverySource`] 的扫描器
pub struct BleScanner {
    source: Arc<dyn DiscoverySource>,
    target: Arc<Mutex<ScanTarget>>,
    default_timeout_ms: u64,
    default_duration_ms: u64,
    listener: JoinHandle<()>,
}

impl BleScanner {
    /// 创建扫描器并安装发现监听
    ///
    /// 必须在 Tokio 运行时内调用。
    pub fn new(source: Arc<dyn DiscoverySource>, options: ScannerOptions) -> Self {
        let target = Arc::new(Mutex::new(ScanTarget::default()));
        let listener = spawn_discovery_listener(Arc::clone(&source), Arc::clone(&target));

        Self {
            source,
            target,
            default_timeout_ms: options.default_timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
            default_duration_ms: options.default_duration_ms.unwrap_or(DEFAULT_DURATION_MS),
            listener,
        }
    }

    pub fn default_timeout_ms(&self) -> u64 {
        self.default_timeout_ms
    }

    pub fn default_duration_ms(&self) -> u64 {
        self.default_duration_ms
    }

    pub fn is_scanning(&self) -> bool {
        self.target.lock().is_scanning
    }

    /// 当前的 uuid 目标
    pub fn uuids(&self) -> Vec<String> {
        self.target.lock().uuids.clone()
    }

    /// 当前的名称目标
    pub fn names(&self) -> Vec<String> {
        self.target.lock().names.clone()
    }

    /// 当前扫描已匹配的外设
    pub fn peripherals(&self) -> Vec<Arc<dyn BlePeripheral>> {
        self.target.lock().peripherals.clone()
    }

    /// 重置目标并启动底层扫描，返回本次扫描的代号和完成信号
    async fn begin_scan(
        &self,
        uuids: Vec<String>,
        names: Vec<String>,
    ) -> Result<(u64, oneshot::Receiver<Vec<Arc<dyn BlePeripheral>>>)> {
        let (tx, rx) = oneshot::channel();
        let generation = {
            let mut target = self.target.lock();
            if let Some(previous) = target.completion.take() {
                debug!("Scan {} superseded by a new scan", target.generation);
                if target.should_return_all() {
                    let _ = previous.send(target.peripherals.clone());
                }
            }
            target.generation += 1;
            target.uuids = uuids;
            target.names = names;
            target.peripherals.clear();
            target.is_scanning = true;
            target.completion = Some(tx);
            target.generation
        };

        if let Err(err) = self.source.start_scanning(&[], false).await {
            let mut target = self.target.lock();
            if target.is_current(generation) {
                target.is_scanning = false;
                target.completion = None;
            }
            return Err(err.into());
        }
        Ok((generation, rx))
    }

    /// 有界扫描：全部目标找到即完成，否则超时报错
    async fn scan(
        &self,
        uuids: Vec<String>,
        names: Vec<String>,
        options: &ScanOptions,
    ) -> Result<Vec<BleController>> {
        let timeout_ms = options.timeout_ms.unwrap_or(self.default_timeout_ms);
        info!("Scanning for uuids={uuids:?} names={names:?} (timeout {timeout_ms} ms)");
        let (generation, completion) = self.begin_scan(uuids.clone(), names.clone()).await?;

        let peripherals = tokio::select! {
            Ok(peripherals) = completion => peripherals,
            () = time::sleep(Duration::from_millis(timeout_ms)) => {
                self.abandon_scan(generation).await;
                return Err(BleError::ScanTimedOut { timeout_ms, uuids, names });
            }
        };

        info!("Scan complete: matched {} peripheral(s)", peripherals.len());
        self.create_controllers(peripherals, options).await
    }

    /// 超时后停止底层扫描并丢弃未决的完成信号，已被取代时什么也不做
    async fn abandon_scan(&self, generation: u64) {
        {
            let mut target = self.target.lock();
            if !target.is_current(generation) {
                trace!("Scan {generation} timed out after being superseded");
                return;
            }
            target.is_scanning = false;
            target.completion = None;
        }
        if let Err(err) = self.source.stop_scanning().await {
            warn!("Failed to stop scanning after timeout: {err}");
        }
    }

    async fn create_controllers(
        &self,
        peripherals: Vec<Arc<dyn BlePeripheral>>,
        options: &ScanOptions,
    ) -> Result<Vec<BleController>> {
        try_join_all(peripherals.into_iter().map(|peripheral| {
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
impl Scanner for BleScanner {
    async fn scan_all(&self, duration_ms: Option<u64>) -> Result<Vec<Arc<dyn BlePeripheral>>> {
        let duration_ms = duration_ms.unwrap_or(self.default_duration_ms);
        info!("Scanning for all peripherals ({duration_ms} ms)");
        let (generation, completion) = self.begin_scan(Vec::new(), Vec::new()).await?;

        let stopped_early = tokio::select! {
            biased;
            Ok(peripherals) = completion => Some(peripherals),
            () = time::sleep(Duration::from_millis(duration_ms)) => None,
        };

        let peripherals = match stopped_early {
            Some(peripherals) => peripherals,
            None => stop(self.source.as_ref(), &self.target, Some(generation))
                .await?
                .unwrap_or_default(),
        };
        info!("Scan complete: found {} peripheral(s)", peripherals.len());
        Ok(peripherals)
    }

    async fn scan_for_uuids(
        &self,
        uuids: Vec<String>,
        options: ScanOptions,
    ) -> Result<Vec<BleController>> {
        self.scan(uuids, Vec::new(), &options).await
    }

    async fn scan_for_names(
        &self,
        names: Vec<String>,
        options: ScanOptions,
    ) -> Result<Vec<BleController>> {
        self.scan(Vec::new(), names, &options).await
    }

    async fn stop_scanning(&self) -> Result<()> {
        stop(self.source.as_ref(), &self.target, None).await.map(|_| ())
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// 停止底层扫描，并用当前结果完成进行中的扫描
///
/// 指定 `generation` 时只在它仍是当前扫描时生效，否则返回 `None`。
async fn stop(
    source: &dyn DiscoverySource,
    target: &Mutex<ScanTarget>,
    generation: Option<u64>,
) -> Result<Option<Vec<Arc<dyn BlePeripheral>>>> {
    let (completion, peripherals) = {
        let mut target = target.lock();
        if generation.is_some_and(|generation| !target.is_current(generation)) {
            return Ok(None);
        }
        target.is_scanning = false;
        (target.completion.take(), target.peripherals.clone())
    };

    let stopped = source.stop_scanning().await;
    if let Some(completion) = completion {
        let _ = completion.send(peripherals.clone());
    }
    stopped?;
    Ok(Some(peripherals))
}

fn spawn_discovery_listener(
    source: Arc<dyn DiscoverySource>,
    target: Arc<Mutex<ScanTarget>>,
) -> JoinHandle<()> {
    let mut discoveries = source.discoveries();
    tokio::spawn(async move {
        loop {
            let peripheral = match discoveries.recv().await {
                Ok(peripheral) => peripheral,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Discovery listener lagged, skipped {skipped} peripherals");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let finished = {
                let mut target = target.lock();
                target.handle_discovery(peripheral).then_some(target.generation)
            };
            if let Some(generation) = finished {
                debug!("All scan targets found, stopping scan");
                if let Err(err) = stop(source.as_ref(), &target, Some(generation)).await {
                    warn!("Failed to stop scanning: {err}");
                }
            }
        }
        debug!("Discovery source closed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDiscovery, FakePeripheral};
    use tokio::time::Instant;

    fn fake_source(peripherals: &[(&str, Option<&str>)]) -> Arc<FakeDiscovery> {
        let source = Arc::new(FakeDiscovery::new());
        for (uuid, name) in peripherals {
            source.add_peripheral(Arc::new(FakePeripheral::new(uuid, *name)));
        }
        source
    }

    fn scanner_for(source: &Arc<FakeDiscovery>) -> BleScanner {
        BleScanner::new(source.clone(), ScannerOptions::default())
    }

    fn uuids_of(controllers: &[BleController]) -> Vec<String> {
        controllers.iter().map(BleController::uuid).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_options() {
        let scanner = scanner_for(&fake_source(&[]));
        assert_eq!(scanner.default_timeout_ms(), 10_000);
        assert_eq!(scanner.default_duration_ms(), 10_000);

        let custom = BleScanner::new(
            Arc::new(FakeDiscovery::new()),
            ScannerOptions {
                default_timeout_ms: Some(5000),
                default_duration_ms: Some(2000),
            },
        );
        assert_eq!(custom.default_timeout_ms(), 5000);
        assert_eq!(custom.default_duration_ms(), 2000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_installed_once() {
        let source = fake_source(&[("a", None)]);
        let scanner = scanner_for(&source);

        scanner.scan_all(Some(10)).await.unwrap();
        scanner.scan_all(Some(10)).await.unwrap();

        assert_eq!(source.discovery_subscriptions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_for_uuids_returns_controllers_in_discovery_order() {
        let source = fake_source(&[("c", None), ("a", None), ("b", None)]);
        let scanner = scanner_for(&source);

        let controllers = scanner
            .scan_for_uuids(vec!["a".into(), "c".into()], ScanOptions::default())
            .await
            .unwrap();

        assert_eq!(uuids_of(&controllers), vec!["c", "a"]);
        assert!(!scanner.is_scanning());
        assert!(source.stop_scanning_calls() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_matched_controllers_are_connected() {
        let source = fake_source(&[("a", None)]);
        let scanner = scanner_for(&source);

        let controller = scanner
            .scan_for_uuid("a", ScanOptions::default())
            .await
            .unwrap();

        let peripheral = source.peripheral("a").unwrap();
        assert_eq!(peripheral.connect_calls(), 1);
        assert_eq!(controller.uuid(), "a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_options_passed_to_controllers() {
        let source = fake_source(&[("a", None)]);
        let scanner = scanner_for(&source);

        let controller = scanner
            .scan_for_uuid(
                "a",
                ScanOptions {
                    rssi_interval_ms: Some(250),
                    ..ScanOptions::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(controller.rssi_interval_ms(), Some(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_for_uuids_waits_for_every_uuid() {
        let source = Arc::new(FakeDiscovery::new());
        let scanner = Arc::new(scanner_for(&source));

        let task = {
            let scanner = scanner.clone();
            tokio::spawn(async move {
                scanner
                    .scan_for_uuids(vec!["a".into(), "b".into()], ScanOptions::default())
                    .await
            })
        };
        time::sleep(Duration::from_millis(1)).await;

        source.discover(Arc::new(FakePeripheral::new("a", None)));
        time::sleep(Duration::from_millis(1)).await;
        assert!(!task.is_finished());
        assert!(scanner.is_scanning());

        source.discover(Arc::new(FakePeripheral::new("b", None)));
        let controllers = task.await.unwrap().unwrap();
        assert_eq!(uuids_of(&controllers), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_discoveries_count_once() {
        let source = Arc::new(FakeDiscovery::new());
        let scanner = Arc::new(scanner_for(&source));

        let task = {
            let scanner = scanner.clone();
            tokio::spawn(async move {
                scanner
                    .scan_for_uuids(
                        vec!["a".into(), "b".into()],
                        ScanOptions::default().with_timeout_ms(100),
                    )
                    .await
            })
        };
        time::sleep(Duration::from_millis(1)).await;

        let a = Arc::new(FakePeripheral::new("a", None));
        source.discover(a.clone());
        source.discover(a);

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.code(), "SCAN_TIMED_OUT");
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_for_uuids_times_out() {
        let source = fake_source(&[("a", None)]);
        let scanner = scanner_for(&source);
        let started = Instant::now();

        let err = scanner
            .scan_for_uuids(
                vec!["a".into(), "missing".into()],
                ScanOptions::default().with_timeout_ms(500),
            )
            .await
            .unwrap_err();

        assert!(started.elapsed() >= Duration::from_millis(500));
        match err {
            BleError::ScanTimedOut {
                timeout_ms,
                uuids,
                names,
            } => {
                assert_eq!(timeout_ms, 500);
                assert_eq!(uuids, vec!["a", "missing"]);
                assert!(names.is_empty());
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!scanner.is_scanning());
        assert_eq!(source.stop_scanning_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_defaults_to_constructor_value() {
        let source = fake_source(&[]);
        let scanner = BleScanner::new(
            source.clone(),
            ScannerOptions {
                default_timeout_ms: Some(300),
                default_duration_ms: None,
            },
        );
        let started = Instant::now();

        let err = scanner
            .scan_for_name("nobody", ScanOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.code(), "SCAN_TIMED_OUT");
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_millis(10_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_for_names_matches_substrings() {
        let source = fake_source(&[
            ("a", Some("CGX Quick-Series Headset")),
            ("b", Some("Muse-S 1234")),
            ("c", None),
        ]);
        let scanner = scanner_for(&source);

        let controllers = scanner
            .scan_for_names(vec!["Quick-Series".into(), "Muse".into()], ScanOptions::default())
            .await
            .unwrap();

        assert_eq!(uuids_of(&controllers), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_for_name_singular() {
        let source = fake_source(&[("a", Some("Other")), ("b", Some("Headset 01"))]);
        let scanner = scanner_for(&source);

        let controller = scanner
            .scan_for_name("Headset", ScanOptions::default())
            .await
            .unwrap();

        assert_eq!(controller.uuid(), "b");
        assert_eq!(controller.name().as_deref(), Some("Headset 01"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_exclusivity() {
        let source = fake_source(&[("a", Some("Headset"))]);
        let scanner = scanner_for(&source);

        scanner
            .scan_for_names(vec!["Headset".into()], ScanOptions::default())
            .await
            .unwrap();
        assert_eq!(scanner.names(), vec!["Headset"]);
        assert!(scanner.uuids().is_empty());

        scanner
            .scan_for_uuids(vec!["a".into()], ScanOptions::default())
            .await
            .unwrap();
        assert_eq!(scanner.uuids(), vec!["a"]);
        assert!(scanner.names().is_empty());

        scanner.scan_all(Some(10)).await.unwrap();
        assert!(scanner.uuids().is_empty());
        assert!(scanner.names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_all_resolves_after_duration() {
        let source = fake_source(&[("a", None), ("b", Some("B"))]);
        let scanner = scanner_for(&source);
        let started = Instant::now();

        let peripherals = scanner.scan_all(Some(200)).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(200));
        let uuids: Vec<String> = peripherals.iter().map(|p| p.uuid()).collect();
        assert_eq!(uuids, vec!["a", "b"]);
        assert!(!scanner.is_scanning());
        assert_eq!(source.stop_scanning_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_all_with_nothing_discoverable_is_empty_not_error() {
        let source = fake_source(&[]);
        let scanner = scanner_for(&source);

        let peripherals = scanner.scan_all(Some(100)).await.unwrap();
        assert!(peripherals.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_all_uses_default_duration() {
        let source = fake_source(&[]);
        let scanner = BleScanner::new(
            source.clone(),
            ScannerOptions {
                default_timeout_ms: None,
                default_duration_ms: Some(750),
            },
        );
        let started = Instant::now();

        scanner.scan_all(None).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(750));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_scanning_resolves_in_flight_scan_all() {
        let source = Arc::new(FakeDiscovery::new());
        let scanner = Arc::new(scanner_for(&source));

        let task = {
            let scanner = scanner.clone();
            tokio::spawn(async move { scanner.scan_all(Some(60_000)).await })
        };
        time::sleep(Duration::from_millis(1)).await;
        source.discover(Arc::new(FakePeripheral::new("a", None)));
        time::sleep(Duration::from_millis(1)).await;

        scanner.stop_scanning().await.unwrap();
        let peripherals = task.await.unwrap().unwrap();

        assert_eq!(peripherals.len(), 1);
        assert!(!scanner.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_timeout_of_superseded_scan_leaves_new_scan_alone() {
        let source = Arc::new(FakeDiscovery::new());
        let scanner = Arc::new(scanner_for(&source));
        let started = Instant::now();

        let first = {
            let scanner = scanner.clone();
            tokio::spawn(async move {
                scanner
                    .scan_for_uuids(vec!["x".into()], ScanOptions::default().with_timeout_ms(100))
                    .await
            })
        };
        time::sleep(Duration::from_millis(10)).await;
        let second = {
            let scanner = scanner.clone();
            tokio::spawn(async move {
                scanner
                    .scan_for_uuids(vec!["b".into()], ScanOptions::default().with_timeout_ms(1000))
                    .await
            })
        };

        // 第一次扫描在 t=100 超时
        time::sleep(Duration::from_millis(140)).await;
        assert!(first.is_finished());
        assert!(scanner.is_scanning());
        assert_eq!(scanner.uuids(), vec!["b"]);
        assert_eq!(source.stop_scanning_calls(), 0);

        source.discover(Arc::new(FakePeripheral::new("b", None)));
        let controllers = second.await.unwrap().unwrap();
        assert_eq!(uuids_of(&controllers), vec!["b"]);
        assert!(started.elapsed() < Duration::from_millis(1000));

        let err = first.await.unwrap().unwrap_err();
        assert_eq!(err.code(), "SCAN_TIMED_OUT");
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_scan_all_does_not_resolve_new_scan() {
        let source = Arc::new(FakeDiscovery::new());
        let scanner = Arc::new(scanner_for(&source));

        let all = {
            let scanner = scanner.clone();
            tokio::spawn(async move { scanner.scan_all(Some(100)).await })
        };
        time::sleep(Duration::from_millis(1)).await;
        source.discover(Arc::new(FakePeripheral::new("early", None)));
        time::sleep(Duration::from_millis(9)).await;

        let targeted = {
            let scanner = scanner.clone();
            tokio::spawn(async move {
                scanner
                    .scan_for_uuids(
                        vec!["a".into(), "b".into()],
                        ScanOptions::default().with_timeout_ms(5000),
                    )
                    .await
            })
        };

        // 被取代的 scan_all 立即以已发现的外设返回
        let found = all.await.unwrap().unwrap();
        let uuids: Vec<String> = found.iter().map(|p| p.uuid()).collect();
        assert_eq!(uuids, vec!["early"]);

        // 越过 scan_all 原本的到期时间
        time::sleep(Duration::from_millis(200)).await;
        assert!(!targeted.is_finished());
        assert!(scanner.is_scanning());

        source.discover(Arc::new(FakePeripheral::new("a", None)));
        time::sleep(Duration::from_millis(1)).await;
        assert!(!targeted.is_finished());

        source.discover(Arc::new(FakePeripheral::new("b", None)));
        let controllers = targeted.await.unwrap().unwrap();
        assert_eq!(uuids_of(&controllers), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_scanning_without_scan_is_safe() {
        let source = fake_source(&[]);
        let scanner = scanner_for(&source);

        scanner.stop_scanning().await.unwrap();
        assert_eq!(source.stop_scanning_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discoveries_ignored_when_not_scanning() {
        let source = Arc::new(FakeDiscovery::new());
        let scanner = scanner_for(&source);

        source.discover(Arc::new(FakePeripheral::new("stray", None)));
        time::sleep(Duration::from_millis(1)).await;

        assert!(scanner.peripherals().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_scanning_failure_propagates() {
        let source = fake_source(&[]);
        source.fail_start_scanning("adapter powered off");
        let scanner = scanner_for(&source);

        let err = scanner
            .scan_for_uuid("a", ScanOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.code(), "BINDING_FAILED");
        assert!(!scanner.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_scanning_without_service_filter() {
        let source = fake_source(&[]);
        let scanner = scanner_for(&source);

        scanner.scan_all(Some(10)).await.unwrap();

        let calls = source.start_scanning_calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].service_uuids.is_empty());
        assert!(!calls[0].allow_duplicates);
    }
}
