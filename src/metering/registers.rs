use std::collections::HashMap;

use log::debug;

use crate::modbus::ModbusTransport;

/// Marker for a register that could not be read or decoded. Carried in
/// `Measurement::value` instead of an error so one bad register never
/// poisons the rest of a poll.
pub const INVALID_VALUE: &str = "xxx";

/// Some channels report `-1` for "no CT clamp connected"; validators for
/// current and voltage capabilities reject it.
pub const INVALID_NUMERIC_VALUE: &str = "-1";

/// Wire encoding of a register as declared by the meter manual.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Uint16,
    Int16,
    Uint16Le,
    Int16Le,
    Uint32,
    Int32,
    Float32,
    /// Signed 16-bit decimal exponent, the measurement is `10^e`.
    Scale,
    String,
}

/// One physical register of a meter model. Tables of these are static per
/// model and never change at runtime.
#[derive(Debug, Clone, Copy)]
pub struct RegisterDefinition {
    pub address: u16,
    pub length: u16,
    pub encoding: Encoding,
    pub label: &'static str,
    /// Decimal exponent applied when converting to the base unit.
    pub scale: i8,
}

pub const fn reg(
    address: u16,
    length: u16,
    encoding: Encoding,
    label: &'static str,
    scale: i8,
) -> RegisterDefinition {
    RegisterDefinition { address, length, encoding, label, scale }
}

/// The two addressable register spaces of the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterSpace {
    Input,
    Holding,
}

/// Decoded reading of one register. `value` is a decimal literal or the
/// invalid marker; `scale` is the decimal exponent as text.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub value: String,
    pub scale: String,
    pub label: String,
}

impl Measurement {
    pub fn invalid(def: &RegisterDefinition) -> Self {
        Measurement {
            value: INVALID_VALUE.to_string(),
            scale: def.scale.to_string(),
            label: def.label.to_string(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.value != INVALID_VALUE && !self.value.is_empty() && !self.scale.is_empty()
    }

    /// The measurement in its base unit: `value * 10^scale`.
    pub fn numeric(&self) -> Option<f64> {
        let value: f64 = self.value.parse().ok()?;
        let scale: i32 = self.scale.parse().unwrap_or(0);
        Some(value * 10f64.powi(scale))
    }
}

/// Decode raw register words per the declared encoding. `None` means the
/// response did not fit the encoding and the caller keeps the invalid marker.
pub fn decode_words(encoding: Encoding, words: &[u16]) -> Option<String> {
    match encoding {
        Encoding::Uint16 => words.first().map(|w| w.to_string()),
        Encoding::Int16 => words.first().map(|w| (*w as i16).to_string()),
        Encoding::Uint16Le => words.first().map(|w| w.swap_bytes().to_string()),
        Encoding::Int16Le => words.first().map(|w| (w.swap_bytes() as i16).to_string()),
        Encoding::Uint32 => {
            let (hi, lo) = (*words.first()?, *words.get(1)?);
            Some((((hi as u32) << 16) | lo as u32).to_string())
        }
        Encoding::Int32 => {
            let (hi, lo) = (*words.first()?, *words.get(1)?);
            Some(((((hi as u32) << 16) | lo as u32) as i32).to_string())
        }
        Encoding::Float32 => {
            let (hi, lo) = (*words.first()?, *words.get(1)?);
            Some(f32::from_bits(((hi as u32) << 16) | lo as u32).to_string())
        }
        Encoding::Scale => {
            let exponent = *words.first()? as i16;
            Some(10f64.powi(exponent as i32).to_string())
        }
        Encoding::String => {
            let mut bytes = Vec::with_capacity(words.len() * 2);
            for w in words {
                bytes.push((w >> 8) as u8);
                bytes.push((w & 0xFF) as u8);
            }
            let text = String::from_utf8_lossy(&bytes).trim_end_matches('\0').to_string();
            if text.is_empty() {
                None
            } else {
                Some(text)
            }
        }
    }
}

/// Read a whole register table. Every key of the table shows up in the
/// result; registers that fail to read or decode carry the invalid marker.
pub async fn read_register_block(
    transport: &mut dyn ModbusTransport,
    space: RegisterSpace,
    registers: &[(&'static str, RegisterDefinition)],
) -> HashMap<String, Measurement> {
    let mut result = HashMap::new();

    for (key, def) in registers {
        let read = match space {
            RegisterSpace::Input => transport.read_input_registers(def.address, def.length).await,
            RegisterSpace::Holding => {
                transport.read_holding_registers(def.address, def.length).await
            }
        };

        let measurement = match read {
            Ok(words) => match decode_words(def.encoding, &words) {
                Some(value) => Measurement {
                    value,
                    scale: def.scale.to_string(),
                    label: def.label.to_string(),
                },
                None => Measurement::invalid(def),
            },
            Err(e) => {
                debug!("Register {key} at {} unreadable: {e}", def.address);
                Measurement::invalid(def)
            }
        };

        result.insert(key.to_string(), measurement);
    }

    result
}

/// Encode a base-unit value for a single-register write. The scale sign is
/// inverted compared to reading: the register wants the raw representation.
pub fn encode_register_value(def: &RegisterDefinition, value: f64) -> Option<u16> {
    let raw = (value * 10f64.powi(-(def.scale as i32))).round();
    if !raw.is_finite() || !(0.0..=u16::MAX as f64).contains(&raw) {
        return None;
    }
    Some(raw as u16)
}
