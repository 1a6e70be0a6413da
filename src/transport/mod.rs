//! MQTT transport for the frame topic and the model queues.

mod endpoint;
mod mqtt;
pub mod wire;

pub use endpoint::{parse_mqtt_endpoint, MqttEndpoint, TlsMaterials};
pub use mqtt::{
    MqttBatchPublisher, MqttEventSource, MqttPublisher, MqttSettings, MqttSubscription,
};
pub use wire::{decode_frame_event, encode_frame_event, FrameEventMessage};
