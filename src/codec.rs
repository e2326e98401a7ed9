//! ==============================================================================
//! codec.rs - sensor envelope encoding and decoding
//! ==============================================================================
//!
//! purpose:
//!     the fixed-schema json object exchanged by nodes, the gateway and the
//!     cloud endpoint:
//!
//! ```text
//!         {"e":"<address>","d":"YYYY-MM-DDTHH:MM:SS","t":..,"uA":..,"uS":..,"p":..}
//! ```
//!
//! precision:
//!     relay encodings (peer -> gateway -> cloud, and the gateway's own mesh
//!     publish) round the four channels to two decimals. the gateway's own
//!     reading sent to the cloud is NOT rounded. the two flavors are kept apart
//!     on purpose until product decides which precision the cloud should get.
//!
//! relationships:
//!     - used by: ingress.rs (decode), egress.rs and workers.rs (encode)
//!
//! ==============================================================================

use serde::Serialize;
use serde_json::Value;

use crate::domain::{ChannelValues, SensorReading};
use crate::error::IngressError;

/// which serialization rules apply to an outgoing envelope
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvelopeFlavor {
    /// channels rounded to two decimals
    Relay,
    /// channels written at full precision
    SelfReading,
}

#[derive(Serialize)]
struct Envelope<'a> {
    e: &'a str,
    d: &'a str,
    t: f64,
    #[serde(rename = "uA")]
    u_a: f64,
    #[serde(rename = "uS")]
    u_s: f64,
    p: f64,
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// encode a reading as a compact envelope string
pub fn encode(reading: &SensorReading, flavor: EnvelopeFlavor) -> String {
    let c = &reading.channels;
    let shape = |v: f64| match flavor {
        EnvelopeFlavor::Relay => round2(v),
        EnvelopeFlavor::SelfReading => v,
    };

    let envelope = Envelope {
        e: &reading.address,
        d: &reading.timestamp,
        t: shape(c.temperature),
        u_a: shape(c.air_humidity),
        u_s: shape(c.soil_moisture),
        p: shape(c.particulates),
    };

    // a struct of strings and finite floats cannot fail to serialize;
    // non-finite floats become null, which decode() maps back to 0
    serde_json::to_string(&envelope).unwrap_or_default()
}

/// decode an envelope
///
/// strict on "e" and "d" (must be present and strings), tolerant on the
/// numeric channels (absent or non-numeric values read as 0).
pub fn decode(payload: &[u8]) -> Result<SensorReading, IngressError> {
    if payload.is_empty() {
        return Err(IngressError::EmptyPayload);
    }

    let root: Value =
        serde_json::from_slice(payload).map_err(|e| IngressError::MalformedJson(e.to_string()))?;

    let obj = root
        .as_object()
        .ok_or_else(|| IngressError::MalformedJson("envelope is not a json object".to_string()))?;

    let address = obj
        .get("e")
        .and_then(Value::as_str)
        .ok_or(IngressError::MissingField("e"))?;
    let timestamp = obj
        .get("d")
        .and_then(Value::as_str)
        .ok_or(IngressError::MissingField("d"))?;

    let num = |key: &str| obj.get(key).and_then(Value::as_f64).unwrap_or(0.0);

    Ok(SensorReading::new(
        address,
        timestamp,
        ChannelValues {
            temperature: num("t"),
            air_humidity: num("uA"),
            soil_moisture: num("uS"),
            particulates: num("p"),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SensorReading {
        SensorReading::new(
            "fd00::1",
            "2024-01-01T00:00:00",
            ChannelValues {
                temperature: 21.456,
                air_humidity: 55.2,
                soil_moisture: 33.0049,
                particulates: 12.0,
            },
        )
    }

    #[test]
    fn test_decode_full_envelope() {
        let payload = br#"{"e":"addr1","d":"2024-01-01T00:00:00","t":21.5,"uA":55.2,"uS":33.0,"p":12.0}"#;
        let r = decode(payload).unwrap();
        assert_eq!(r.address, "addr1");
        assert_eq!(r.timestamp, "2024-01-01T00:00:00");
        assert_eq!(r.channels.temperature, 21.5);
        assert_eq!(r.channels.air_humidity, 55.2);
        assert_eq!(r.channels.soil_moisture, 33.0);
        assert_eq!(r.channels.particulates, 12.0);
    }

    #[test]
    fn test_decode_requires_strings() {
        let no_e = br#"{"d":"2024-01-01T00:00:00","t":1}"#;
        assert_eq!(decode(no_e), Err(IngressError::MissingField("e")));

        let no_d = br#"{"e":"addr1","t":1}"#;
        assert_eq!(decode(no_d), Err(IngressError::MissingField("d")));

        // present but not a string counts as missing
        let numeric_e = br#"{"e":42,"d":"2024-01-01T00:00:00"}"#;
        assert_eq!(decode(numeric_e), Err(IngressError::MissingField("e")));
    }

    #[test]
    fn test_decode_tolerates_numeric_fields() {
        let payload = br#"{"e":"n","d":"2024-01-01T00:00:00","t":"warm","uA":null}"#;
        let r = decode(payload).unwrap();
        assert_eq!(r.channels, ChannelValues::default());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(decode(b""), Err(IngressError::EmptyPayload));
        assert!(matches!(decode(b"{\"e\":"), Err(IngressError::MalformedJson(_))));
        assert!(matches!(decode(b"[1,2]"), Err(IngressError::MalformedJson(_))));
    }

    #[test]
    fn test_relay_rounds_self_does_not() {
        let r = sample();
        let relay = encode(&r, EnvelopeFlavor::Relay);
        assert!(relay.contains("\"t\":21.46"), "{relay}");
        assert!(relay.contains("\"uS\":33.0"), "{relay}");

        let own = encode(&r, EnvelopeFlavor::SelfReading);
        assert!(own.contains("\"t\":21.456"), "{own}");
        assert!(own.contains("\"uS\":33.0049"), "{own}");
    }

    #[test]
    fn test_key_order_and_round_trip() {
        let r = sample();
        let json = encode(&r, EnvelopeFlavor::Relay);
        assert!(json.starts_with("{\"e\":\"fd00::1\",\"d\":\"2024-01-01T00:00:00\",\"t\":"));

        let back = decode(json.as_bytes()).unwrap();
        assert_eq!(back.address, r.address);
        assert_eq!(back.timestamp, r.timestamp);
        assert!((back.channels.temperature - r.channels.temperature).abs() <= 0.01);
        assert!((back.channels.air_humidity - r.channels.air_humidity).abs() <= 0.01);
        assert!((back.channels.soil_moisture - r.channels.soil_moisture).abs() <= 0.01);
        assert!((back.channels.particulates - r.channels.particulates).abs() <= 0.01);
    }
}
