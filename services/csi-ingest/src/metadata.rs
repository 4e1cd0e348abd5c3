use crate::error::{IngestError, IngestResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Largest millisecond timestamp accepted (year 9999)
pub const MAX_TIMESTAMP_MS: i64 = 253_402_300_799_999;

/// Metadata for one CSI message inside a blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    /// MAC address of the transmitter the CSI was measured for
    pub mac_address: String,
    /// Capture time in milliseconds since the Unix epoch
    pub timestamp_ms: i64,
    /// Collector device that produced the blob
    pub device_name: String,
    /// Byte offset of the message within the blob
    pub offset_in_file: i64,
    /// Size of the message in bytes
    pub message_size: i64,
    pub message_id: i64,
    pub access_point: i64,
    pub channel_number: i64,
    pub matrix_rows: i64,
    pub matrix_columns: i64,
    pub bandwidth: i64,
    pub spatial_channels: i64,
    pub rssi: i64,
    /// 802.11 frame control field
    pub fc: i64,
    /// 802.11 sequence number
    pub sequence_number: i64,
    /// Object key of the blob this message lives in, set once the batch is named
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// A metadata array that passed validation
#[derive(Debug, Clone)]
pub struct ValidatedBatch {
    /// Records in the order they were received
    pub records: Vec<MetadataRecord>,
    /// Smallest timestamp over all records
    pub earliest_timestamp_ms: i64,
    /// Device name shared by every record
    pub device_name: String,
}

impl ValidatedBatch {
    /// Stamp every record with the object key of its blob
    pub fn annotate_location(&mut self, location: &str) {
        for record in &mut self.records {
            record.location = Some(location.to_string());
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Parse and validate a raw metadata array
pub fn validate_metadata(raw: &str) -> IngestResult<ValidatedBatch> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| IngestError::Parse(e.to_string()))?;

    let packets = match value {
        Value::Array(packets) => packets,
        other => {
            return Err(IngestError::Parse(format!(
                "expected a JSON array, found {}",
                json_type(&other)
            )))
        }
    };

    if packets.is_empty() {
        return Err(IngestError::EmptyBatch);
    }

    let mut records: Vec<MetadataRecord> = Vec::with_capacity(packets.len());
    let mut earliest_timestamp_ms = i64::MAX;

    for (index, packet) in packets.iter().enumerate() {
        let record = parse_record(index, packet)?;

        if let Some(first) = records.first() {
            if first.device_name != record.device_name {
                return Err(IngestError::InconsistentDevice {
                    index,
                    expected: first.device_name.clone(),
                    found: record.device_name,
                });
            }
        }

        earliest_timestamp_ms = earliest_timestamp_ms.min(record.timestamp_ms);
        records.push(record);
    }

    let device_name = records[0].device_name.clone();

    debug!(
        device_name = %device_name,
        record_count = records.len(),
        earliest_timestamp_ms,
        "Metadata batch validated"
    );

    Ok(ValidatedBatch {
        records,
        earliest_timestamp_ms,
        device_name,
    })
}

fn parse_record(index: usize, packet: &Value) -> IngestResult<MetadataRecord> {
    let fields = packet.as_object().ok_or_else(|| {
        IngestError::schema(
            index,
            "<record>",
            format!("must be an object, found {}", json_type(packet)),
        )
    })?;

    let reader = FieldReader { index, fields };

    let device_name = reader.string("device_name")?;
    check_device_name(index, &device_name)?;

    Ok(MetadataRecord {
        mac_address: reader.string("mac_address")?,
        timestamp_ms: reader.timestamp_ms("timestamp")?,
        device_name,
        offset_in_file: reader.non_negative("offset_in_file")?,
        message_size: reader.non_negative("message_size")?,
        message_id: reader.integer("message_id")?,
        access_point: reader.integer("access_point")?,
        channel_number: reader.integer("channel_number")?,
        matrix_rows: reader.integer("matrix_rows")?,
        matrix_columns: reader.integer("matrix_columns")?,
        bandwidth: reader.integer("bandwidth")?,
        spatial_channels: reader.integer("spatial_channels")?,
        rssi: reader.integer("rssi")?,
        fc: reader.integer("fc")?,
        sequence_number: reader.integer("sequence_number")?,
        location: None,
    })
}

/// The device name becomes a path segment, so it must not be able to escape it
fn check_device_name(index: usize, name: &str) -> IngestResult<()> {
    if name.is_empty() {
        return Err(IngestError::schema(index, "device_name", "must not be empty"));
    }

    if name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(IngestError::schema(
            index,
            "device_name",
            "must be a single path segment",
        ));
    }

    Ok(())
}

struct FieldReader<'a> {
    index: usize,
    fields: &'a Map<String, Value>,
}

impl<'a> FieldReader<'a> {
    fn get(&self, name: &str) -> IngestResult<&'a Value> {
        match self.fields.get(name) {
            Some(Value::Null) | None => Err(IngestError::schema(self.index, name, "is missing")),
            Some(value) => Ok(value),
        }
    }

    fn string(&self, name: &str) -> IngestResult<String> {
        let value = self.get(name)?;
        value.as_str().map(str::to_string).ok_or_else(|| {
            IngestError::schema(
                self.index,
                name,
                format!("must be a string, found {}", json_type(value)),
            )
        })
    }

    fn integer(&self, name: &str) -> IngestResult<i64> {
        let value = self.get(name)?;
        match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => n.as_i64().ok_or_else(|| {
                IngestError::schema(self.index, name, "is out of range for a 64-bit integer")
            }),
            other => Err(IngestError::schema(
                self.index,
                name,
                format!("must be an integer, found {}", json_type(other)),
            )),
        }
    }

    fn non_negative(&self, name: &str) -> IngestResult<i64> {
        let value = self.integer(name)?;
        if value < 0 {
            return Err(IngestError::schema(self.index, name, "must not be negative"));
        }
        Ok(value)
    }

    fn timestamp_ms(&self, name: &str) -> IngestResult<i64> {
        let value = self.get(name)?;
        let seconds = value.as_f64().ok_or_else(|| {
            IngestError::schema(
                self.index,
                name,
                format!("must be a number, found {}", json_type(value)),
            )
        })?;

        seconds_to_millis(seconds)
            .ok_or_else(|| IngestError::schema(self.index, name, "is not a valid epoch time"))
    }
}

/// Convert fractional epoch seconds to whole milliseconds.
///
/// The value is rounded to the microsecond first so that decimal inputs such
/// as `1700000000.123` are not truncated to `...122` by binary float error;
/// the sub-millisecond remainder is then dropped.
pub fn seconds_to_millis(seconds: f64) -> Option<i64> {
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }

    let micros = (seconds * 1_000_000.0).round();
    let millis = (micros / 1_000.0).floor();
    if millis > MAX_TIMESTAMP_MS as f64 {
        return None;
    }

    Some(millis as i64)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn packet(device_name: &str, timestamp: f64) -> Value {
        json!({
            "mac_address": "aa:bb:cc:dd:ee:ff",
            "timestamp": timestamp,
            "device_name": device_name,
            "offset_in_file": 0,
            "message_size": 10,
            "message_id": 1,
            "access_point": 2,
            "channel_number": 36,
            "matrix_rows": 4,
            "matrix_columns": 64,
            "bandwidth": 80,
            "spatial_channels": 2,
            "rssi": -52,
            "fc": 136,
            "sequence_number": 4021
        })
    }

    #[test]
    fn test_single_record_batch() {
        let raw = json!([packet("rpi-01", 1700000000.250)]).to_string();
        let batch = validate_metadata(&raw).unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(batch.device_name, "rpi-01");
        assert_eq!(batch.earliest_timestamp_ms, 1_700_000_000_250);
        assert_eq!(batch.records[0].rssi, -52);
        assert_eq!(batch.records[0].location, None);
    }

    #[test]
    fn test_earliest_timestamp_is_minimum() {
        let raw = json!([
            packet("rpi-01", 1700000005.0),
            packet("rpi-01", 1700000001.5),
            packet("rpi-01", 1700000003.0)
        ])
        .to_string();

        let batch = validate_metadata(&raw).unwrap();
        assert_eq!(batch.earliest_timestamp_ms, 1_700_000_001_500);
        // Order is preserved
        assert_eq!(batch.records[0].timestamp_ms, 1_700_000_005_000);
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            validate_metadata("[{\"mac_address\": "),
            Err(IngestError::Parse(_))
        ));
    }

    #[test]
    fn test_non_array_rejected() {
        let raw = packet("rpi-01", 1.0).to_string();
        assert!(matches!(validate_metadata(&raw), Err(IngestError::Parse(_))));
    }

    #[test]
    fn test_empty_array() {
        assert!(matches!(validate_metadata("[]"), Err(IngestError::EmptyBatch)));
    }

    #[test]
    fn test_missing_field_names_record() {
        let mut second = packet("rpi-01", 1700000000.0);
        second.as_object_mut().unwrap().remove("rssi");
        let raw = json!([packet("rpi-01", 1700000000.0), second]).to_string();

        match validate_metadata(&raw) {
            Err(IngestError::Schema { index, field, .. }) => {
                assert_eq!(index, 1);
                assert_eq!(field, "rssi");
            }
            other => panic!("Expected schema error, got {:?}", other),
        }
    }

    #[test]
    fn test_string_number_not_coerced() {
        let mut p = packet("rpi-01", 1700000000.0);
        p["channel_number"] = json!("36");
        let raw = json!([p]).to_string();

        assert!(matches!(
            validate_metadata(&raw),
            Err(IngestError::Schema { field, .. }) if field == "channel_number"
        ));
    }

    #[test]
    fn test_float_in_integer_field_rejected() {
        let mut p = packet("rpi-01", 1700000000.0);
        p["bandwidth"] = json!(80.5);
        let raw = json!([p]).to_string();

        assert!(matches!(
            validate_metadata(&raw),
            Err(IngestError::Schema { field, .. }) if field == "bandwidth"
        ));
    }

    #[test]
    fn test_integer_timestamp_accepted() {
        let mut p = packet("rpi-01", 0.0);
        p["timestamp"] = json!(1700000000);
        let batch = validate_metadata(&json!([p]).to_string()).unwrap();
        assert_eq!(batch.earliest_timestamp_ms, 1_700_000_000_000);
    }

    #[test]
    fn test_negative_timestamp_rejected() {
        let raw = json!([packet("rpi-01", -1.0)]).to_string();
        assert!(matches!(
            validate_metadata(&raw),
            Err(IngestError::Schema { field, .. }) if field == "timestamp"
        ));
    }

    #[test]
    fn test_negative_offset_rejected() {
        let mut p = packet("rpi-01", 1700000000.0);
        p["offset_in_file"] = json!(-4);
        let raw = json!([p]).to_string();

        assert!(matches!(
            validate_metadata(&raw),
            Err(IngestError::Schema { field, .. }) if field == "offset_in_file"
        ));
    }

    #[test]
    fn test_mixed_devices_rejected() {
        let raw = json!([
            packet("rpi-01", 1700000000.0),
            packet("rpi-02", 1700000001.0)
        ])
        .to_string();

        match validate_metadata(&raw) {
            Err(IngestError::InconsistentDevice {
                index,
                expected,
                found,
            }) => {
                assert_eq!(index, 1);
                assert_eq!(expected, "rpi-01");
                assert_eq!(found, "rpi-02");
            }
            other => panic!("Expected inconsistent device error, got {:?}", other),
        }
    }

    #[test]
    fn test_path_like_device_name_rejected() {
        for name in ["", "..", "../etc", "a/b", "a\\b"] {
            let raw = json!([packet(name, 1700000000.0)]).to_string();
            assert!(
                matches!(
                    validate_metadata(&raw),
                    Err(IngestError::Schema { ref field, .. }) if field == "device_name"
                ),
                "device name {:?} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_extra_fields_ignored() {
        let mut p = packet("rpi-01", 1700000000.0);
        p["firmware"] = json!("v2");
        assert!(validate_metadata(&json!([p]).to_string()).is_ok());
    }

    #[test]
    fn test_seconds_to_millis() {
        assert_eq!(seconds_to_millis(1700000000.123), Some(1_700_000_000_123));
        assert_eq!(seconds_to_millis(1700000000.9999), Some(1_700_000_000_999));
        assert_eq!(seconds_to_millis(0.0), Some(0));
        assert_eq!(seconds_to_millis(f64::NAN), None);
        assert_eq!(seconds_to_millis(f64::INFINITY), None);
        assert_eq!(seconds_to_millis(1e300), None);
    }

    #[test]
    fn test_annotate_location() {
        let raw = json!([packet("rpi-01", 1.0), packet("rpi-01", 2.0)]).to_string();
        let mut batch = validate_metadata(&raw).unwrap();
        batch.annotate_location("csi-data/rpi-01/x.bin");

        assert!(batch
            .records
            .iter()
            .all(|r| r.location.as_deref() == Some("csi-data/rpi-01/x.bin")));
    }
}
