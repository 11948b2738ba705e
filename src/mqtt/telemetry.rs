// Telemetry document published on <prefix>/status

use serde::{Serialize, Serializer};

/// One flat JSON document. Absent readings serialize as `null`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Telemetry {
    pub co2_ppm: Option<u16>,
    #[serde(serialize_with = "one_decimal")]
    pub temp_c: Option<f32>,
    pub humidity_pct: Option<u8>,
    #[serde(serialize_with = "two_decimals")]
    pub battery_v: Option<f32>,
    pub firmware: String,
    pub uptime_s: u64,
    pub brightness: u8,
    pub abc: bool,
    pub ota: &'static str,
}

impl Telemetry {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

fn one_decimal<S: Serializer>(value: &Option<f32>, s: S) -> Result<S::Ok, S::Error> {
    rounded(value, 10.0, s)
}

fn two_decimals<S: Serializer>(value: &Option<f32>, s: S) -> Result<S::Ok, S::Error> {
    rounded(value, 100.0, s)
}

fn rounded<S: Serializer>(value: &Option<f32>, scale: f32, s: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(v) if v.is_finite() => s.serialize_f32((v * scale).round() / scale),
        _ => s.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn absent_readings_are_null() {
        let t = Telemetry {
            firmware: "0.3.0+0012".into(),
            uptime_s: 61,
            brightness: 10,
            ota: "idle",
            ..Default::default()
        };
        let v: Value = serde_json::from_str(&t.to_json().unwrap()).unwrap();
        assert_eq!(v["co2_ppm"], Value::Null);
        assert_eq!(v["temp_c"], Value::Null);
        assert_eq!(v["humidity_pct"], Value::Null);
        assert_eq!(v["battery_v"], Value::Null);
        assert_eq!(v["firmware"], "0.3.0+0012");
        assert_eq!(v["uptime_s"], 61);
        assert_eq!(v["brightness"], 10);
        assert_eq!(v["abc"], false);
        assert_eq!(v["ota"], "idle");
    }

    #[test]
    fn readings_are_rounded() {
        let t = Telemetry {
            co2_ppm: Some(612),
            temp_c: Some(21.46),
            humidity_pct: Some(40),
            battery_v: Some(3.8712),
            ..Default::default()
        };
        let json = t.to_json().unwrap();
        assert!(json.contains(r#""co2_ppm":612"#), "{json}");
        assert!(json.contains(r#""temp_c":21.5"#), "{json}");
        assert!(json.contains(r#""humidity_pct":40"#), "{json}");
        assert!(json.contains(r#""battery_v":3.87"#), "{json}");
    }

    #[test]
    fn non_finite_values_are_null() {
        let t = Telemetry {
            temp_c: Some(f32::NAN),
            ..Default::default()
        };
        let v: Value = serde_json::from_str(&t.to_json().unwrap()).unwrap();
        assert_eq!(v["temp_c"], Value::Null);
    }
}
