//! `VARIANT` marshalling.
//!
//! Incoming variants are copied into [`Variant`] without interpreting their
//! payload; the codec decides what is valid. Outgoing ones are built as
//! [`OwnedVariant`], which clears itself after the call.

use crate::errors::{OpcError, OpcResult};
use crate::typedefs::VarType;
use crate::variant::{ArrayBound, SafeArray, Variant, VariantData};
use std::mem::ManuallyDrop;
use windows::Win32::System::Com::SAFEARRAY;
use windows::Win32::System::Ole::{
    SafeArrayCreateVector, SafeArrayGetDim, SafeArrayGetElement, SafeArrayGetLBound,
    SafeArrayGetUBound, SafeArrayGetVartype, SafeArrayPutElement,
};
use windows::Win32::System::Variant::{VARENUM, VARIANT, VariantClear};
use windows::core::BSTR;

/// Payload width in bytes of the scalar types carried as raw bits.
const fn scalar_width(vt: VarType) -> Option<u32> {
    match vt {
        VarType::EMPTY | VarType::NULL => Some(0),
        VarType::I1 | VarType::UI1 => Some(1),
        VarType::I2 | VarType::UI2 | VarType::BOOL => Some(2),
        VarType::I4
        | VarType::UI4
        | VarType::R4
        | VarType::ERROR
        | VarType::INT
        | VarType::UINT => Some(4),
        VarType::I8 | VarType::UI8 | VarType::R8 | VarType::CY | VarType::DATE => Some(8),
        _ => None,
    }
}

const fn mask(bits: u64, width: u32) -> u64 {
    if width >= 8 {
        bits
    } else {
        bits & ((1_u64 << (width * 8)) - 1)
    }
}

/// Copies a server variant.
///
/// Types the codec never decodes come back without payload.
///
/// # Safety
///
/// `variant` must be initialized and its `vt` must describe its payload.
pub(crate) unsafe fn variant_from_com(variant: &VARIANT) -> Variant {
    // SAFETY: the tag is always readable on an initialized variant.
    let vt = VarType(unsafe { variant.Anonymous.Anonymous.vt.0 });
    if vt.is_byref() {
        return Variant::new(vt, VariantData::Empty);
    }
    if vt.is_array() {
        // SAFETY: `VT_ARRAY` variants carry a `SAFEARRAY` pointer.
        let parray = unsafe { variant.Anonymous.Anonymous.Anonymous.parray };
        if parray.is_null() {
            return Variant::new(vt, VariantData::Empty);
        }
        // SAFETY: non-null array pointer owned by `variant`.
        let array = unsafe { array_from_com(vt.base(), parray) };
        return Variant::new(vt, array.map_or(VariantData::Empty, VariantData::Array));
    }
    if vt == VarType::BSTR {
        // SAFETY: `VT_BSTR` variants carry a (possibly null) BSTR.
        let bstr: &BSTR = unsafe { &variant.Anonymous.Anonymous.Anonymous.bstrVal };
        if bstr.is_empty() {
            return Variant::new(vt, VariantData::Empty);
        }
        return Variant::new(vt, VariantData::Bstr(bstr.as_wide().to_vec()));
    }
    match scalar_width(vt) {
        Some(0) => Variant::new(vt, VariantData::Empty),
        Some(width) => {
            // SAFETY: the value union is at least 8 bytes wide.
            let bits = unsafe {
                (&raw const variant.Anonymous.Anonymous.Anonymous)
                    .cast::<u64>()
                    .read_unaligned()
            };
            Variant::bits(vt, mask(bits, width))
        }
        None => Variant::new(vt, VariantData::Empty),
    }
}

/// Reads a `SAFEARRAY`; `None` when any bound or element is unreadable.
///
/// # Safety
///
/// `parray` must point to a live array.
unsafe fn array_from_com(declared: VarType, parray: *const SAFEARRAY) -> Option<SafeArray> {
    // SAFETY: `parray` is live per the caller.
    let element_type = unsafe { SafeArrayGetVartype(parray) }
        .map(|vt| VarType(vt.0))
        .unwrap_or(declared);
    // SAFETY: as above.
    let dims = unsafe { SafeArrayGetDim(parray) };

    let mut dimensions = Vec::new();
    for dim in 1..=dims {
        // SAFETY: `dim` is within `1..=SafeArrayGetDim`.
        let lower = unsafe { SafeArrayGetLBound(parray, dim) }.ok()?;
        // SAFETY: as above.
        let upper = unsafe { SafeArrayGetUBound(parray, dim) }.ok()?;
        let count = u32::try_from(i64::from(upper) - i64::from(lower) + 1).unwrap_or(0);
        dimensions.push(ArrayBound { lower, count });
    }

    let mut elements = Vec::new();
    if let [bound] = dimensions.as_slice() {
        let upper = bound.lower.checked_add_unsigned(bound.count)?;
        for index in bound.lower..upper {
            // SAFETY: `index` lies within the single dimension's bounds.
            elements.push(unsafe { element_from_com(element_type, parray, index) }?);
        }
    }

    Some(SafeArray {
        element_type,
        dimensions,
        elements,
    })
}

/// # Safety
///
/// `index` must lie within the bounds of the one-dimensional `parray`.
unsafe fn element_from_com(
    element_type: VarType,
    parray: *const SAFEARRAY,
    index: i32,
) -> Option<Variant> {
    match element_type {
        VarType::VARIANT => {
            let mut element = VARIANT::default();
            // SAFETY: the array copies a `VARIANT` into `element`, which we own.
            unsafe { SafeArrayGetElement(parray, &raw const index, (&raw mut element).cast()) }
                .ok()?;
            // SAFETY: `element` was just initialized by the array.
            let value = unsafe { variant_from_com(&element) };
            // SAFETY: `element` owns its copy.
            let _ = unsafe { VariantClear(&raw mut element) };
            Some(value)
        }
        VarType::BSTR => {
            let mut element = BSTR::default();
            // SAFETY: the array writes a fresh BSTR copy that `element` frees.
            unsafe { SafeArrayGetElement(parray, &raw const index, (&raw mut element).cast()) }
                .ok()?;
            if element.is_empty() {
                Some(Variant::new(element_type, VariantData::Empty))
            } else {
                Some(Variant::new(
                    element_type,
                    VariantData::Bstr(element.as_wide().to_vec()),
                ))
            }
        }
        _ => {
            let width = scalar_width(element_type).filter(|width| *width > 0)?;
            let mut bits = 0_u64;
            // SAFETY: scalar elements are at most 8 bytes.
            unsafe { SafeArrayGetElement(parray, &raw const index, (&raw mut bits).cast()) }
                .ok()?;
            Some(Variant::bits(element_type, mask(bits, width)))
        }
    }
}

/// A `VARIANT` built for a write; cleared on drop.
#[repr(transparent)]
#[derive(Default)]
pub(crate) struct OwnedVariant(VARIANT);

impl OwnedVariant {
    fn set_vt(&mut self, vt: VarType) {
        // SAFETY: writing the tag of a variant we own.
        unsafe { (*self.0.Anonymous.Anonymous).vt = VARENUM(vt.0) };
    }

    #[cfg(test)]
    pub(crate) const fn as_raw(&self) -> &VARIANT {
        &self.0
    }
}

impl Drop for OwnedVariant {
    fn drop(&mut self) {
        // SAFETY: the variant was built by `variant_to_com` and is consistent.
        if let Err(err) = unsafe { VariantClear(&raw mut self.0) } {
            tracing::warn!(error = ?err, "VariantClear failed on a write value");
        }
    }
}

/// Builds a native variant from an encoded one.
pub(crate) fn variant_to_com(variant: &Variant) -> OpcResult<OwnedVariant> {
    let mut owned = OwnedVariant::default();
    match &variant.data {
        VariantData::Empty => owned.set_vt(variant.vt),
        VariantData::Bits(bits) => {
            // SAFETY: the value union is at least 8 bytes wide and plain data
            // for every bits type.
            unsafe {
                (&raw mut (*owned.0.Anonymous.Anonymous).Anonymous)
                    .cast::<u64>()
                    .write_unaligned(*bits);
            }
            owned.set_vt(variant.vt);
        }
        VariantData::Bstr(wide) => {
            // SAFETY: the tag is set right after, so the BSTR is owned and
            // freed by `VariantClear`.
            unsafe {
                (*owned.0.Anonymous.Anonymous).Anonymous.bstrVal =
                    ManuallyDrop::new(BSTR::from_wide(wide));
            }
            owned.set_vt(VarType::BSTR);
        }
        VariantData::Array(array) => {
            let count = u32::try_from(array.elements.len())?;
            // SAFETY: plain allocation; null is checked below.
            let parray = unsafe { SafeArrayCreateVector(VARENUM(array.element_type.0), 0, count) };
            if parray.is_null() {
                return Err(OpcError::Internal(format!(
                    "SafeArrayCreateVector failed for {} elements",
                    count
                )));
            }
            // SAFETY: from here the variant owns the array and frees it on
            // any early return.
            unsafe { (*owned.0.Anonymous.Anonymous).Anonymous.parray = parray };
            owned.set_vt(array.element_type.array_of());
            for (index, element) in (0_i32..).zip(&array.elements) {
                // SAFETY: `index` is below the vector length just allocated.
                unsafe { put_element(parray, index, array.element_type, element) }?;
            }
        }
    }
    Ok(owned)
}

/// # Safety
///
/// `parray` must be a live vector of `element_type` longer than `index`.
unsafe fn put_element(
    parray: *const SAFEARRAY,
    index: i32,
    element_type: VarType,
    element: &Variant,
) -> OpcResult<()> {
    let put = match (element_type, &element.data) {
        (VarType::VARIANT, _) => {
            let element = variant_to_com(element)?;
            // SAFETY: the array deep-copies the variant.
            unsafe {
                SafeArrayPutElement(parray, &raw const index, (&raw const element.0).cast())
            }
        }
        (VarType::BSTR, VariantData::Bstr(wide)) => {
            let bstr = BSTR::from_wide(wide);
            // SAFETY: BSTR elements are passed as the string pointer and copied.
            unsafe { SafeArrayPutElement(parray, &raw const index, bstr.as_ptr().cast()) }
        }
        (VarType::BSTR, VariantData::Empty) => Ok(()),
        (_, VariantData::Bits(bits)) => {
            // SAFETY: the array copies its element width from the LE bits.
            unsafe { SafeArrayPutElement(parray, &raw const index, (&raw const *bits).cast()) }
        }
        _ => {
            return Err(OpcError::Conversion(format!(
                "Element {:?} does not fit an array of {:?}",
                element.vt, element_type
            )));
        }
    };
    put.map_err(|err| {
        OpcError::native(
            "SafeArrayPutElement",
            super::memory::to_hresult(err.code()),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_variant, encode_value};
    use crate::variant::{ArrayValue, Value};

    fn round_trip(value: Value) -> Value {
        let encoded = encode_value(&value).unwrap();
        let owned = variant_to_com(&encoded).unwrap();
        // SAFETY: `owned` was just built and is live.
        let copied = unsafe { variant_from_com(owned.as_raw()) };
        decode_variant(&copied).unwrap()
    }

    #[test]
    fn test_scalars_survive_native_layout() {
        assert_eq!(round_trip(Value::I4(-7)), Value::I4(-7));
        assert_eq!(round_trip(Value::Bool(true)), Value::Bool(true));
        assert_eq!(round_trip(Value::R8(2.5)), Value::R8(2.5));
        assert_eq!(round_trip(Value::U1(200)), Value::U1(200));
    }

    #[test]
    fn test_bstr_and_empty_string() {
        assert_eq!(round_trip(Value::from("pump")), Value::from("pump"));
        assert_eq!(round_trip(Value::from("")), Value::from(""));
    }

    #[test]
    fn test_vector_of_i4() {
        let value = Value::Array(ArrayValue::new(
            VarType::I4,
            vec![Value::I4(1), Value::I4(2), Value::I4(3)],
        ));
        assert_eq!(round_trip(value.clone()), value);
    }

    #[test]
    fn test_byref_is_copied_without_payload() {
        let mut raw = VARIANT::default();
        // SAFETY: only the tag is written; the payload is never read.
        unsafe { (*raw.Anonymous.Anonymous).vt = VARENUM(VarType::I4.0 | VarType::BYREF.0) };
        // SAFETY: `raw` is initialized.
        let copied = unsafe { variant_from_com(&raw) };
        assert_eq!(copied.data, VariantData::Empty);
        assert!(decode_variant(&copied).is_err());
    }
}
