pub mod binding;
pub mod connector;
pub mod controller;
pub mod platform;
pub mod scanner;

pub use binding::{
    BleCharacteristic, BlePeripheral, BleService, CharacteristicProperty, DiscoverySource,
    PeripheralEvent, PeripheralState, ServicesAndCharacteristics, display_name,
};
pub use connector::{BleConnector, ConnectorOptions};
pub use controller::{
    BleController, CharacteristicCallback, CharacteristicCallbacks, ControllerOptions,
};
pub use platform::{BtleplugCharacteristic, BtleplugDiscovery, BtleplugPeripheral};
pub use scanner::{
    BleScanner, DEFAULT_DURATION_MS, DEFAULT_TIMEOUT_MS, ScanOptions, Scanner, ScannerOptions,
};
