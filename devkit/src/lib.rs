/*!
# Fishway DevKit - test doubles for the gateway

Drives a real `Gateway` without an MQTT broker:
- `MockBus` records every outgoing publish and can simulate a dead link
- `DeviceMessageBuilder` builds controller-shaped telemetry and replies
- `TestHarness` wires gateway, store, registry and live feed together
*/

pub mod mqtt_stub;
pub mod test_utils;

pub use mqtt_stub::{DeviceMessageBuilder, MockBus, MockMessage};
pub use test_utils::{RecordingHooks, RecordingPersistence, TestHarness};
