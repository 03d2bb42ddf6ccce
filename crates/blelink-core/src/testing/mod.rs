//! 测试替身
//!
//! 不依赖蓝牙硬件的发现源、外设、特征和扫描器。所有调用计数都保存在实例上，
//! 并行运行的测试互不影响。

mod discovery;
mod peripheral;
mod scanner;

pub use discovery::{FakeDiscovery, StartScanningCall};
pub use peripheral::{FAKE_SERVICE_UUID, FakeCharacteristic, FakePeripheral};
pub use scanner::{FakeScanner, ScannerCall};
