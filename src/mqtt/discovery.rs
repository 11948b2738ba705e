// Home Assistant MQTT discovery documents

use serde_json::{json, Map, Value};

use super::{Topics, PAYLOAD_OFFLINE, PAYLOAD_ONLINE};

pub const DISCOVERY_PREFIX: &str = "homeassistant";

/// The device block shared by every entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub device_id: String,
    pub name: String,
    pub model: String,
    pub manufacturer: String,
    pub sw_version: String,
}

impl DeviceDescriptor {
    /// Identifier derived from the topic prefix (`c6-demo` -> `c6_demo`).
    pub fn for_prefix(prefix: &str, sw_version: &str) -> Self {
        Self {
            device_id: prefix.replace('-', "_"),
            name: "C6 Demo".to_string(),
            model: "ESP32-C6 Touch LCD 1.47".to_string(),
            manufacturer: "Espressif".to_string(),
            sw_version: sw_version.to_string(),
        }
    }

    fn to_json(&self) -> Value {
        json!({
            "identifiers": [self.device_id],
            "name": self.name,
            "model": self.model,
            "manufacturer": self.manufacturer,
            "sw_version": self.sw_version,
        })
    }
}

enum Entity {
    Sensor {
        key: &'static str,
        name: &'static str,
        field: &'static str,
        unit: &'static str,
        device_class: &'static str,
    },
    Button {
        key: &'static str,
        name: &'static str,
        press: &'static str,
    },
    Switch {
        key: &'static str,
        name: &'static str,
    },
    Number {
        key: &'static str,
        name: &'static str,
        min: u8,
        max: u8,
    },
}

const ENTITIES: &[Entity] = &[
    Entity::Sensor {
        key: "co2",
        name: "C6 CO2",
        field: "co2_ppm",
        unit: "ppm",
        device_class: "carbon_dioxide",
    },
    Entity::Sensor {
        key: "temperature",
        name: "C6 Temperature",
        field: "temp_c",
        unit: "°C",
        device_class: "temperature",
    },
    Entity::Sensor {
        key: "humidity",
        name: "C6 Humidity",
        field: "humidity_pct",
        unit: "%",
        device_class: "humidity",
    },
    Entity::Sensor {
        key: "battery",
        name: "C6 Battery",
        field: "battery_v",
        unit: "V",
        device_class: "voltage",
    },
    Entity::Button {
        key: "zero_calibrate",
        name: "C6 Zero Calibrate",
        press: "zero_calibrate",
    },
    Entity::Button {
        key: "reboot",
        name: "C6 Reboot",
        press: "reboot",
    },
    Entity::Switch {
        key: "abc",
        name: "C6 ABC",
    },
    Entity::Number {
        key: "brightness",
        name: "C6 Brightness",
        min: 0,
        max: 100,
    },
];

impl Entity {
    fn component(&self) -> &'static str {
        match self {
            Entity::Sensor { .. } => "sensor",
            Entity::Button { .. } => "button",
            Entity::Switch { .. } => "switch",
            Entity::Number { .. } => "number",
        }
    }

    fn key(&self) -> &'static str {
        match self {
            Entity::Sensor { key, .. }
            | Entity::Button { key, .. }
            | Entity::Switch { key, .. }
            | Entity::Number { key, .. } => key,
        }
    }

    fn document(&self, topics: &Topics, device: &DeviceDescriptor) -> Value {
        let mut doc = match self {
            Entity::Sensor {
                name,
                field,
                unit,
                device_class,
                ..
            } => json!({
                "name": name,
                "state_topic": topics.status,
                "value_template": format!("{{{{ value_json.{} }}}}", field),
                "unit_of_measurement": unit,
                "device_class": device_class,
                "state_class": "measurement",
            }),
            Entity::Button { name, press, .. } => json!({
                "name": name,
                "command_topic": topics.cmd,
                "payload_press": press,
            }),
            Entity::Switch { name, .. } => json!({
                "name": name,
                "command_topic": topics.cmd,
                "state_topic": topics.status,
                "value_template": "{{ 'abc:on' if value_json.abc else 'abc:off' }}",
                "payload_on": "abc:on",
                "payload_off": "abc:off",
            }),
            Entity::Number { name, min, max, .. } => json!({
                "name": name,
                "command_topic": topics.cmd,
                "command_template": "brightness:{{ value }}",
                "state_topic": topics.status,
                "value_template": "{{ value_json.brightness }}",
                "min": min,
                "max": max,
                "step": 1,
                "mode": "slider",
                "unit_of_measurement": "%",
            }),
        };

        let common: Map<String, Value> = [
            ("availability_topic", json!(topics.availability)),
            ("payload_available", json!(PAYLOAD_ONLINE)),
            ("payload_not_available", json!(PAYLOAD_OFFLINE)),
            ("unique_id", json!(format!("{}-{}", device.device_id, self.key()))),
            ("device", device.to_json()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        if let Value::Object(map) = &mut doc {
            map.extend(common);
        }
        doc
    }
}

/// `(topic, payload)` for every entity, in publish order.
pub fn documents(topics: &Topics, device: &DeviceDescriptor) -> Vec<(String, String)> {
    ENTITIES
        .iter()
        .map(|entity| {
            let topic = format!(
                "{}/{}/{}/{}/config",
                DISCOVERY_PREFIX,
                entity.component(),
                device.device_id,
                entity.key()
            );
            (topic, entity.document(topics, device).to_string())
        })
        .collect()
}
