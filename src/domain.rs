use serde::{Deserialize, Serialize};

/// wall-clock format carried in the envelope "d" field
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// timestamp used when the clock has never been set
pub const EPOCH_TIMESTAMP: &str = "1970-01-01T00:00:00";

/// the four numeric channels every node reports
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelValues {
    /// air temperature in celsius
    pub temperature: f64,
    /// relative air humidity (0-100%)
    pub air_humidity: f64,
    /// soil moisture / conductivity (0-100%)
    pub soil_moisture: f64,
    /// particulate / gas estimate in ppm
    pub particulates: f64,
}

impl ChannelValues {
    /// true once every channel has produced a non-zero value
    pub fn all_nonzero(&self) -> bool {
        self.temperature != 0.0
            && self.air_humidity != 0.0
            && self.soil_moisture != 0.0
            && self.particulates != 0.0
    }
}

/// one sensor reading from one node
///
/// immutable once produced: a newer reading replaces, never mutates, an older one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// mesh identity of the node that produced the reading
    pub address: String,
    /// local wall-clock time, formatted with TIMESTAMP_FORMAT
    pub timestamp: String,
    /// measured values
    pub channels: ChannelValues,
}

impl SensorReading {
    pub fn new(address: impl Into<String>, timestamp: impl Into<String>, channels: ChannelValues) -> Self {
        Self {
            address: address.into(),
            timestamp: timestamp.into(),
            channels,
        }
    }

    /// placeholder reading used before the gateway has sampled anything
    pub fn empty(address: impl Into<String>) -> Self {
        Self::new(address, EPOCH_TIMESTAMP, ChannelValues::default())
    }
}

/// current local time in envelope format
pub fn local_timestamp() -> String {
    chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_timestamp_shape() {
        let ts = local_timestamp();
        assert_eq!(ts.len(), 19);
        assert_eq!(&ts[4..5], "-");
        assert_eq!(&ts[10..11], "T");
        assert!(chrono::NaiveDateTime::parse_from_str(&ts, TIMESTAMP_FORMAT).is_ok());
    }

    #[test]
    fn test_all_nonzero() {
        let mut c = ChannelValues {
            temperature: 21.0,
            air_humidity: 40.0,
            soil_moisture: 10.0,
            particulates: 3.0,
        };
        assert!(c.all_nonzero());
        c.soil_moisture = 0.0;
        assert!(!c.all_nonzero());
        assert!(!ChannelValues::default().all_nonzero());
    }
}
