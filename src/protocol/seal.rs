//! Sensor-seal telemetry payload decoding.
//!
//! MSGSTATUS payloads carry a stream of tagged measurement fields, each a
//! 1-byte tag followed by a fixed-width big-endian value. The decoder is
//! deliberately partial: whatever fields the seal reported are surfaced,
//! everything else stays `None`.

/// A decoded telemetry update. Every field is optional; sensor seals
/// report only what their hardware samples.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorSealUpdate {
    /// UID of the reporting sensor seal (distinct from the gateway UID).
    pub seal_uid: Option<[u8; 4]>,
    /// Degrees Celsius.
    pub temperature: Option<f32>,
    /// Millimetres per second squared.
    pub vibration: Option<f32>,
    pub rpm: Option<u32>,
    /// Volts.
    pub voltage: Option<f32>,
    pub msg_id: Option<u32>,
}

impl SensorSealUpdate {
    /// True when no field was decoded.
    pub fn is_empty(&self) -> bool {
        *self == SensorSealUpdate::default()
    }
}

/// Turns a decrypted MSGSTATUS payload into a telemetry update.
///
/// The server core treats the parser as opaque dispatch; deployments with
/// different seal firmware substitute their own implementation.
pub trait UpdateParser: Send {
    fn parse(&self, payload: &[u8]) -> SensorSealUpdate;
}

/// Field tags emitted by sensor-seal firmware.
const TAG_SEAL_UID: u8 = 0x01;
const TAG_TEMPERATURE: u8 = 0x02;
const TAG_VIBRATION: u8 = 0x03;
const TAG_RPM: u8 = 0x04;
const TAG_VOLTAGE: u8 = 0x05;
const TAG_MSG_ID: u8 = 0x06;

/// Stock decoder for the sensor-seal field stream.
///
/// Scaled integer encodings: temperature in hundredths of a degree,
/// vibration in thousandths of mm/s², voltage in millivolts.
pub struct SealUpdateParser;

impl UpdateParser for SealUpdateParser {
    fn parse(&self, payload: &[u8]) -> SensorSealUpdate {
        let mut update = SensorSealUpdate::default();
        let mut rest = payload;

        while let Some((&tag, after)) = rest.split_first() {
            let consumed = match tag {
                TAG_SEAL_UID => take::<4>(after).map(|(v, r)| {
                    update.seal_uid = Some(v);
                    r
                }),
                TAG_TEMPERATURE => take::<2>(after).map(|(v, r)| {
                    update.temperature = Some(i16::from_be_bytes(v) as f32 / 100.0);
                    r
                }),
                TAG_VIBRATION => take::<4>(after).map(|(v, r)| {
                    update.vibration = Some(u32::from_be_bytes(v) as f32 / 1000.0);
                    r
                }),
                TAG_RPM => take::<4>(after).map(|(v, r)| {
                    update.rpm = Some(u32::from_be_bytes(v));
                    r
                }),
                TAG_VOLTAGE => take::<2>(after).map(|(v, r)| {
                    update.voltage = Some(u16::from_be_bytes(v) as f32 / 1000.0);
                    r
                }),
                TAG_MSG_ID => take::<4>(after).map(|(v, r)| {
                    update.msg_id = Some(u32::from_be_bytes(v));
                    r
                }),
                _ => {
                    tracing::debug!("unknown seal field tag {:#04x}, stopping decode", tag);
                    return update;
                }
            };

            rest = match consumed {
                Some(r) => r,
                None => {
                    tracing::debug!("truncated value for seal field tag {:#04x}", tag);
                    return update;
                }
            };
        }

        update
    }
}

/// Split a fixed-width value off the front of a slice.
fn take<const N: usize>(data: &[u8]) -> Option<([u8; N], &[u8])> {
    if data.len() < N {
        return None;
    }
    let value: [u8; N] = data[..N].try_into().expect("length checked");
    Some((value, &data[N..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(payload: &[u8]) -> SensorSealUpdate {
        SealUpdateParser.parse(payload)
    }

    #[test]
    fn test_empty_payload() {
        let update = decode(&[]);
        assert!(update.is_empty());
    }

    #[test]
    fn test_full_record() {
        let mut payload = vec![TAG_SEAL_UID, 0xDE, 0xAD, 0xBE, 0xEF];
        payload.extend_from_slice(&[TAG_TEMPERATURE, 0x09, 0xC4]); // 25.00 C
        payload.extend_from_slice(&[TAG_VIBRATION, 0x00, 0x00, 0x03, 0xE8]); // 1.000
        payload.extend_from_slice(&[TAG_RPM, 0x00, 0x00, 0x0B, 0xB8]); // 3000
        payload.extend_from_slice(&[TAG_VOLTAGE, 0x0C, 0xE4]); // 3.300 V
        payload.extend_from_slice(&[TAG_MSG_ID, 0x00, 0x00, 0x00, 0x2A]);

        let update = decode(&payload);
        assert_eq!(update.seal_uid, Some([0xDE, 0xAD, 0xBE, 0xEF]));
        assert_eq!(update.temperature, Some(25.0));
        assert_eq!(update.vibration, Some(1.0));
        assert_eq!(update.rpm, Some(3000));
        assert_eq!(update.voltage, Some(3.3));
        assert_eq!(update.msg_id, Some(42));
    }

    #[test]
    fn test_negative_temperature() {
        // -12.50 C = -1250 hundredths
        let raw = (-1250i16).to_be_bytes();
        let update = decode(&[TAG_TEMPERATURE, raw[0], raw[1]]);
        assert_eq!(update.temperature, Some(-12.5));
    }

    #[test]
    fn test_partial_record() {
        let update = decode(&[TAG_RPM, 0x00, 0x00, 0x00, 0x64]);
        assert_eq!(update.rpm, Some(100));
        assert_eq!(update.temperature, None);
        assert_eq!(update.seal_uid, None);
    }

    #[test]
    fn test_unknown_tag_stops_decode() {
        let mut payload = vec![TAG_RPM, 0x00, 0x00, 0x00, 0x64];
        payload.push(0x7F); // unknown
        payload.extend_from_slice(&[TAG_MSG_ID, 0, 0, 0, 1]);

        let update = decode(&payload);
        assert_eq!(update.rpm, Some(100));
        // Fields after the unknown tag are not reached.
        assert_eq!(update.msg_id, None);
    }

    #[test]
    fn test_truncated_value_keeps_earlier_fields() {
        let mut payload = vec![TAG_VOLTAGE, 0x0C, 0xE4];
        payload.extend_from_slice(&[TAG_RPM, 0x00, 0x00]); // 2 of 4 bytes

        let update = decode(&payload);
        assert_eq!(update.voltage, Some(3.3));
        assert_eq!(update.rpm, None);
    }
}
