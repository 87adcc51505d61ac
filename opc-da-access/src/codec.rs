//! Conversion between native variant buffers and typed values.
//!
//! Decoding is per element: a tag this crate cannot represent fails that
//! element with `DISP_E_BADVARTYPE` (or `DISP_E_TYPEMISMATCH` when the payload
//! does not match its tag) and its siblings still decode. Encoding is all or
//! nothing and fails before any native call.

use crate::errors::{OpcError, OpcResult};
use crate::typedefs::{FileTime, Hresult, ItemHandle, ItemValue, Quality, VarType};
use crate::variant::{ArrayValue, Currency, SafeArray, Value, Variant, VariantData};
use chrono::{DateTime, NaiveDateTime, Utc};

const FILETIME_TO_UNIX_SECS: i64 = 11_644_473_600;
const TICKS_PER_SECOND: u64 = 10_000_000;
const MILLIS_PER_DAY: i64 = 86_400_000;
const MILLIS_PER_DAY_F64: f64 = 86_400_000.0;
/// Days from the OLE epoch (1899-12-30) to the Unix epoch.
const OLE_TO_UNIX_DAYS: i64 = 25_569;
/// First day past 9999-12-31 in OLE days.
const OLE_DATE_LIMIT: f64 = 2_958_466.0;

/// Parallel per-item arrays of a data-change or read-complete buffer.
#[derive(Debug, Clone, Copy)]
pub struct ValueBuffers<'a> {
    pub client_handles: &'a [ItemHandle],
    pub values: &'a [Variant],
    pub qualities: &'a [u16],
    pub timestamps: &'a [FileTime],
    pub errors: &'a [Hresult],
}

impl ValueBuffers<'_> {
    fn check(&self, count: usize) -> OpcResult<()> {
        let lengths = [
            ("client handle", self.client_handles.len()),
            ("value", self.values.len()),
            ("quality", self.qualities.len()),
            ("timestamp", self.timestamps.len()),
            ("error", self.errors.len()),
        ];
        match lengths.iter().find(|(_, len)| *len < count) {
            Some((name, len)) => Err(OpcError::Conversion(format!(
                "{name} buffer holds {len} entries, expected {count}"
            ))),
            None => Ok(()),
        }
    }
}

/// A write buffer built from typed values.
///
/// Scoped to one native call; backends convert it to their own owned
/// representation and release that when the call returns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariantBuffer {
    variants: Vec<Variant>,
}

impl VariantBuffer {
    pub fn as_slice(&self) -> &[Variant] {
        &self.variants
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }
}

/// Decodes exactly `count` items from parallel value buffers.
///
/// Each buffer must hold at least `count` entries; anything past `count` is
/// never read. Items whose server status is already a failure are not
/// decoded and carry `Value::Empty`.
pub fn decode_values(count: usize, buffers: &ValueBuffers<'_>) -> OpcResult<Vec<ItemValue>> {
    buffers.check(count)?;

    let values = buffers
        .client_handles
        .iter()
        .zip(buffers.values)
        .zip(buffers.qualities)
        .zip(buffers.timestamps)
        .zip(buffers.errors)
        .take(count)
        .map(|((((client, variant), quality), timestamp), error)| {
            decode_item(*client, variant, *quality, *timestamp, *error)
        })
        .collect();

    Ok(values)
}

/// Decodes one item record; shared by callbacks and synchronous reads.
pub(crate) fn decode_item(
    client_handle: ItemHandle,
    variant: &Variant,
    quality: u16,
    timestamp: FileTime,
    error: Hresult,
) -> ItemValue {
    let (value, error) = if error.is_err() {
        (Value::Empty, error)
    } else {
        match decode_variant(variant) {
            Ok(value) => (value, error),
            Err(code) => {
                tracing::warn!(
                    client_handle = client_handle.0,
                    vt = %variant.vt,
                    code = %code,
                    "Item value could not be decoded"
                );
                (Value::Empty, code)
            }
        }
    };

    ItemValue {
        client_handle,
        value,
        quality: Quality(quality),
        timestamp: filetime_to_datetime(timestamp),
        error,
    }
}

/// Decodes a single variant into a typed value.
pub fn decode_variant(variant: &Variant) -> Result<Value, Hresult> {
    let vt = variant.vt;
    if vt.is_byref() {
        return Err(Hresult::DISP_E_BADVARTYPE);
    }
    if vt.is_array() {
        return decode_array(vt.base(), &variant.data);
    }
    decode_scalar(vt, &variant.data)
}

fn decode_array(element_type: VarType, data: &VariantData) -> Result<Value, Hresult> {
    if !is_array_element_type(element_type) {
        return Err(Hresult::DISP_E_BADVARTYPE);
    }
    let VariantData::Array(array) = data else {
        return Err(Hresult::DISP_E_TYPEMISMATCH);
    };
    let [bound] = array.dimensions.as_slice() else {
        return Err(Hresult::DISP_E_BADVARTYPE);
    };
    if array.element_type != element_type
        || usize::try_from(bound.count).ok() != Some(array.elements.len())
    {
        return Err(Hresult::DISP_E_TYPEMISMATCH);
    }

    let elements = array
        .elements
        .iter()
        .map(|element| {
            if element_type == VarType::VARIANT {
                if element.vt.is_array() || element.vt.is_byref() {
                    return Err(Hresult::DISP_E_BADVARTYPE);
                }
                decode_scalar(element.vt, &element.data)
            } else if element.vt == element_type {
                decode_scalar(element_type, &element.data)
            } else {
                Err(Hresult::DISP_E_TYPEMISMATCH)
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Value::Array(ArrayValue::new(
        canonical(element_type),
        elements,
    )))
}

fn decode_scalar(vt: VarType, data: &VariantData) -> Result<Value, Hresult> {
    match vt {
        VarType::EMPTY => Ok(Value::Empty),
        VarType::NULL => Ok(Value::Null),
        VarType::BSTR => match data {
            // A null BSTR is the empty string.
            VariantData::Empty => Ok(Value::String(String::new())),
            VariantData::Bstr(wide) => String::from_utf16(wide)
                .map(Value::String)
                .map_err(|_| Hresult::DISP_E_TYPEMISMATCH),
            _ => Err(Hresult::DISP_E_TYPEMISMATCH),
        },
        _ if !is_bits_type(vt) => Err(Hresult::DISP_E_BADVARTYPE),
        _ => match data {
            VariantData::Bits(bits) => decode_bits(vt, *bits),
            _ => Err(Hresult::DISP_E_TYPEMISMATCH),
        },
    }
}

fn decode_bits(vt: VarType, bits: u64) -> Result<Value, Hresult> {
    let b = bits.to_le_bytes();
    let low4 = [b[0], b[1], b[2], b[3]];
    let value = match vt {
        // VARIANT_TRUE is -1; any non-zero pattern reads as true.
        VarType::BOOL => Value::Bool(i16::from_le_bytes([b[0], b[1]]) != 0),
        VarType::I1 => Value::I1(i8::from_le_bytes([b[0]])),
        VarType::UI1 => Value::U1(b[0]),
        VarType::I2 => Value::I2(i16::from_le_bytes([b[0], b[1]])),
        VarType::UI2 => Value::U2(u16::from_le_bytes([b[0], b[1]])),
        VarType::I4 | VarType::INT => Value::I4(i32::from_le_bytes(low4)),
        VarType::UI4 | VarType::UINT => Value::U4(u32::from_le_bytes(low4)),
        VarType::I8 => Value::I8(i64::from_le_bytes(b)),
        VarType::UI8 => Value::U8(bits),
        VarType::R4 => Value::R4(f32::from_bits(u32::from_le_bytes(low4))),
        VarType::R8 => Value::R8(f64::from_bits(bits)),
        VarType::CY => Value::Currency(Currency(i64::from_le_bytes(b))),
        VarType::DATE => Value::Date(
            ole_date_to_datetime(f64::from_bits(bits)).ok_or(Hresult::DISP_E_OVERFLOW)?,
        ),
        VarType::ERROR => Value::Error(Hresult(i32::from_le_bytes(low4))),
        _ => return Err(Hresult::DISP_E_BADVARTYPE),
    };
    Ok(value)
}

/// Encodes a typed value for a write.
pub fn encode_value(value: &Value) -> OpcResult<Variant> {
    match value {
        Value::Array(array) => encode_array(array),
        scalar => encode_scalar(scalar),
    }
}

/// Encodes a batch of write values; any invalid value fails the batch.
pub fn encode_values(values: &[Value]) -> OpcResult<VariantBuffer> {
    let variants = values.iter().map(encode_value).collect::<OpcResult<_>>()?;
    Ok(VariantBuffer { variants })
}

fn encode_array(array: &ArrayValue) -> OpcResult<Variant> {
    let element_type = array.element_type;
    if !is_array_element_type(element_type) {
        return Err(OpcError::InvalidArgument(format!(
            "{element_type} is not a supported array element type"
        )));
    }

    let elements = array
        .elements
        .iter()
        .map(|element| {
            if element_type != VarType::VARIANT && element.var_type() != element_type {
                return Err(OpcError::InvalidArgument(format!(
                    "Array of {element_type} holds a {} element",
                    element.var_type()
                )));
            }
            encode_scalar(element)
        })
        .collect::<OpcResult<Vec<_>>>()?;

    Ok(Variant::new(
        element_type.array_of(),
        VariantData::Array(SafeArray::vector(element_type, elements)),
    ))
}

fn encode_scalar(value: &Value) -> OpcResult<Variant> {
    let vt = value.var_type();
    let variant = match value {
        Value::Empty | Value::Null => Variant::new(vt, VariantData::Empty),
        Value::Bool(v) => Variant::bits(vt, if *v { 0xFFFF } else { 0 }),
        Value::I1(v) => Variant::bits(vt, pack(&v.to_le_bytes())),
        Value::U1(v) => Variant::bits(vt, u64::from(*v)),
        Value::I2(v) => Variant::bits(vt, pack(&v.to_le_bytes())),
        Value::U2(v) => Variant::bits(vt, u64::from(*v)),
        Value::I4(v) => Variant::bits(vt, pack(&v.to_le_bytes())),
        Value::U4(v) => Variant::bits(vt, u64::from(*v)),
        Value::I8(v) => Variant::bits(vt, pack(&v.to_le_bytes())),
        Value::U8(v) => Variant::bits(vt, *v),
        Value::R4(v) => Variant::bits(vt, u64::from(v.to_bits())),
        Value::R8(v) => Variant::bits(vt, v.to_bits()),
        Value::Currency(v) => Variant::bits(vt, pack(&v.0.to_le_bytes())),
        Value::Date(v) => Variant::bits(vt, datetime_to_ole_date(*v).to_bits()),
        Value::String(v) => Variant::new(vt, VariantData::Bstr(v.encode_utf16().collect())),
        Value::Error(v) => Variant::bits(vt, pack(&v.0.to_le_bytes())),
        Value::Array(_) => {
            return Err(OpcError::InvalidArgument(
                "Nested arrays are not supported".into(),
            ));
        }
    };
    Ok(variant)
}

fn pack(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw[..bytes.len()].copy_from_slice(bytes);
    u64::from_le_bytes(raw)
}

const fn is_bits_type(vt: VarType) -> bool {
    matches!(
        vt,
        VarType::BOOL
            | VarType::I1
            | VarType::UI1
            | VarType::I2
            | VarType::UI2
            | VarType::I4
            | VarType::UI4
            | VarType::INT
            | VarType::UINT
            | VarType::I8
            | VarType::UI8
            | VarType::R4
            | VarType::R8
            | VarType::CY
            | VarType::DATE
            | VarType::ERROR
    )
}

const fn is_array_element_type(vt: VarType) -> bool {
    is_bits_type(vt) || matches!(vt, VarType::BSTR | VarType::VARIANT)
}

const fn canonical(vt: VarType) -> VarType {
    match vt {
        VarType::INT => VarType::I4,
        VarType::UINT => VarType::UI4,
        other => other,
    }
}

/// Converts a `FILETIME`; an all-zero value means "no timestamp".
pub fn filetime_to_datetime(ft: FileTime) -> Option<DateTime<Utc>> {
    if ft.is_zero() {
        return None;
    }
    let ticks = ft.ticks();
    let secs = i64::try_from(ticks / TICKS_PER_SECOND).ok()? - FILETIME_TO_UNIX_SECS;
    let nanos = u32::try_from(ticks % TICKS_PER_SECOND).ok()? * 100;
    DateTime::from_timestamp(secs, nanos)
}

/// Converts to a `FILETIME`; instants before 1601 map to zero.
pub fn datetime_to_filetime(dt: DateTime<Utc>) -> FileTime {
    let Ok(secs) = u64::try_from(dt.timestamp() + FILETIME_TO_UNIX_SECS) else {
        return FileTime::default();
    };
    let ticks = secs
        .saturating_mul(TICKS_PER_SECOND)
        .saturating_add(u64::from(dt.timestamp_subsec_nanos() / 100));
    FileTime::from_ticks(ticks)
}

/// Converts an OLE automation date, rounded to the millisecond.
///
/// Before the OLE epoch the integer part counts days backwards while the
/// fraction still counts forward from midnight: -1.25 is 1899-12-29 06:00.
#[allow(clippy::cast_possible_truncation)]
pub fn ole_date_to_datetime(ole: f64) -> Option<NaiveDateTime> {
    if !ole.is_finite() || ole.abs() >= OLE_DATE_LIMIT {
        return None;
    }
    let days = ole.trunc();
    let fraction = (ole - days).abs();
    let millis = (days as i64) * MILLIS_PER_DAY + (fraction * MILLIS_PER_DAY_F64).round() as i64;
    DateTime::from_timestamp_millis(millis - OLE_TO_UNIX_DAYS * MILLIS_PER_DAY)
        .map(|dt| dt.naive_utc())
}

/// Converts to an OLE automation date, truncated to the millisecond.
#[allow(clippy::cast_precision_loss)]
pub fn datetime_to_ole_date(dt: NaiveDateTime) -> f64 {
    let millis = dt.and_utc().timestamp_millis() + OLE_TO_UNIX_DAYS * MILLIS_PER_DAY;
    let days = millis.div_euclid(MILLIS_PER_DAY);
    let fraction = millis.rem_euclid(MILLIS_PER_DAY) as f64 / MILLIS_PER_DAY_F64;
    if days >= 0 {
        days as f64 + fraction
    } else {
        days as f64 - fraction
    }
}
