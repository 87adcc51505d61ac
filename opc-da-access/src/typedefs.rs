use crate::variant::{Value, Variant};
use chrono::{DateTime, Utc};
use std::fmt;

/// Opaque handle for an OPC group.
///
/// Used for both the client-assigned and the server-assigned group handle;
/// the field name says which one a value is.
///
/// # Examples
///
/// ```
/// use opc_da_access::GroupHandle;
/// let handle = GroupHandle(123u32);
/// assert_eq!(handle.0, 123u32);
/// ```
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GroupHandle(pub u32);

/// Opaque handle for an OPC item.
///
/// Similar to [`GroupHandle`], this keeps item handles from being mixed up
/// with group handles or plain counters.
///
/// # Examples
///
/// ```
/// use opc_da_access::ItemHandle;
/// let handle = ItemHandle(456u32);
/// assert_eq!(handle.0, 456u32);
/// ```
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ItemHandle(pub u32);

/// A COM status code.
///
/// Negative values are failures. Per-item results carry one of these for
/// every input element.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hresult(pub i32);

#[allow(clippy::unreadable_literal)]
impl Hresult {
    pub const S_OK: Self = Self(0);
    pub const S_FALSE: Self = Self(1);
    pub const E_NOTIMPL: Self = Self::from_u32(0x80004001);
    pub const E_NOINTERFACE: Self = Self::from_u32(0x80004002);
    pub const E_POINTER: Self = Self::from_u32(0x80004003);
    pub const E_FAIL: Self = Self::from_u32(0x80004005);
    pub const E_INVALIDARG: Self = Self::from_u32(0x80070057);
    pub const DISP_E_TYPEMISMATCH: Self = Self::from_u32(0x80020005);
    pub const DISP_E_BADVARTYPE: Self = Self::from_u32(0x80020008);
    pub const DISP_E_OVERFLOW: Self = Self::from_u32(0x8002000A);
    pub const CONNECT_E_NOCONNECTION: Self = Self::from_u32(0x80040200);
    pub const OPC_E_INVALIDHANDLE: Self = Self::from_u32(0xC0040001);
    pub const OPC_E_BADTYPE: Self = Self::from_u32(0xC0040004);
    pub const OPC_E_BADRIGHTS: Self = Self::from_u32(0xC0040006);
    pub const OPC_E_UNKNOWNITEMID: Self = Self::from_u32(0xC0040007);
    pub const OPC_E_INVALIDITEMID: Self = Self::from_u32(0xC0040008);
    pub const OPC_E_UNKNOWNPATH: Self = Self::from_u32(0xC004000A);
    pub const OPC_E_RANGE: Self = Self::from_u32(0xC004000B);
    pub const OPC_S_UNSUPPORTEDRATE: Self = Self::from_u32(0x0004000D);

    /// Reinterprets the unsigned form used in headers and logs.
    #[allow(clippy::cast_possible_wrap)]
    pub const fn from_u32(code: u32) -> Self {
        Self(code as i32)
    }

    #[allow(clippy::cast_sign_loss)]
    pub const fn as_u32(self) -> u32 {
        self.0 as u32
    }

    pub const fn is_ok(self) -> bool {
        self.0 >= 0
    }

    pub const fn is_err(self) -> bool {
        self.0 < 0
    }

    /// Human-readable hint for well-known codes.
    pub const fn hint(self) -> Option<&'static str> {
        crate::errors::friendly_hresult_hint(self)
    }
}

impl fmt::Debug for Hresult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hresult(0x{:08X})", self.as_u32())
    }
}

impl fmt::Display for Hresult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.as_u32())
    }
}

/// Variant type tag (`VARTYPE`).
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct VarType(pub u16);

impl VarType {
    pub const EMPTY: Self = Self(0);
    pub const NULL: Self = Self(1);
    pub const I2: Self = Self(2);
    pub const I4: Self = Self(3);
    pub const R4: Self = Self(4);
    pub const R8: Self = Self(5);
    pub const CY: Self = Self(6);
    pub const DATE: Self = Self(7);
    pub const BSTR: Self = Self(8);
    pub const DISPATCH: Self = Self(9);
    pub const ERROR: Self = Self(10);
    pub const BOOL: Self = Self(11);
    pub const VARIANT: Self = Self(12);
    pub const UNKNOWN: Self = Self(13);
    pub const DECIMAL: Self = Self(14);
    pub const I1: Self = Self(16);
    pub const UI1: Self = Self(17);
    pub const UI2: Self = Self(18);
    pub const UI4: Self = Self(19);
    pub const I8: Self = Self(20);
    pub const UI8: Self = Self(21);
    pub const INT: Self = Self(22);
    pub const UINT: Self = Self(23);
    pub const ARRAY: Self = Self(0x2000);
    pub const BYREF: Self = Self(0x4000);

    /// Strips the `ARRAY`/`BYREF` modifier bits.
    pub const fn base(self) -> Self {
        Self(self.0 & 0x0FFF)
    }

    pub const fn is_array(self) -> bool {
        self.0 & Self::ARRAY.0 != 0
    }

    pub const fn is_byref(self) -> bool {
        self.0 & Self::BYREF.0 != 0
    }

    /// The `ARRAY` form of this element type.
    pub const fn array_of(self) -> Self {
        Self(self.0 | Self::ARRAY.0)
    }
}

impl fmt::Debug for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.base() {
            Self::EMPTY => "EMPTY",
            Self::NULL => "NULL",
            Self::I2 => "I2",
            Self::I4 => "I4",
            Self::R4 => "R4",
            Self::R8 => "R8",
            Self::CY => "CY",
            Self::DATE => "DATE",
            Self::BSTR => "BSTR",
            Self::DISPATCH => "DISPATCH",
            Self::ERROR => "ERROR",
            Self::BOOL => "BOOL",
            Self::VARIANT => "VARIANT",
            Self::UNKNOWN => "UNKNOWN",
            Self::DECIMAL => "DECIMAL",
            Self::I1 => "I1",
            Self::UI1 => "UI1",
            Self::UI2 => "UI2",
            Self::UI4 => "UI4",
            Self::I8 => "I8",
            Self::UI8 => "UI8",
            Self::INT => "INT",
            Self::UINT => "UINT",
            other => return write!(f, "VT(0x{:04X})", other.0 | (self.0 & 0xF000)),
        };
        if self.is_byref() {
            f.write_str("BYREF|")?;
        }
        if self.is_array() {
            f.write_str("ARRAY|")?;
        }
        f.write_str(name)
    }
}

impl fmt::Display for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Reading source for synchronous reads and refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataSource {
    /// Served from the group's cache; inactive items report out-of-service.
    #[default]
    Cache,
    /// Forces the server to read the field device.
    Device,
}

impl DataSource {
    /// `OPC_DS_CACHE` / `OPC_DS_DEVICE`.
    pub const fn as_native(self) -> u32 {
        match self {
            Self::Cache => 1,
            Self::Device => 2,
        }
    }
}

/// Access rights the server grants on an item.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AccessRights(pub u32);

impl AccessRights {
    pub const READABLE: Self = Self(0x1);
    pub const WRITEABLE: Self = Self(0x2);
    pub const READ_WRITE: Self = Self(0x3);

    pub const fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub const fn is_writeable(self) -> bool {
        self.0 & Self::WRITEABLE.0 != 0
    }
}

/// Top-level quality classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityStatus {
    Good,
    Uncertain,
    Bad,
    Unknown,
}

/// OPC quality word: status, sub-status and limit bits.
///
/// # Examples
///
/// ```
/// use opc_da_access::{Quality, QualityStatus};
/// let q = Quality(0xC0);
/// assert_eq!(q.status(), QualityStatus::Good);
/// assert_eq!(q.to_string(), "Good");
/// ```
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Quality(pub u16);

impl Quality {
    pub const BAD: Self = Self(0x00);
    pub const BAD_OUT_OF_SERVICE: Self = Self(0x1C);
    pub const UNCERTAIN: Self = Self(0x40);
    pub const GOOD: Self = Self(0xC0);

    pub const fn status(self) -> QualityStatus {
        match self.0 & 0xC0 {
            0xC0 => QualityStatus::Good,
            0x40 => QualityStatus::Uncertain,
            0x00 => QualityStatus::Bad,
            _ => QualityStatus::Unknown,
        }
    }

    /// Sub-status field (bits 2..6).
    pub const fn substatus(self) -> u16 {
        (self.0 >> 2) & 0x0F
    }

    /// Limit field (bits 0..2).
    pub const fn limit(self) -> u16 {
        self.0 & 0x03
    }

    /// Vendor-specific high byte.
    pub const fn vendor(self) -> u16 {
        self.0 >> 8
    }

    pub const fn is_good(self) -> bool {
        matches!(self.status(), QualityStatus::Good)
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status() {
            QualityStatus::Good => f.write_str("Good"),
            QualityStatus::Uncertain => f.write_str("Uncertain"),
            QualityStatus::Bad => f.write_str("Bad"),
            QualityStatus::Unknown => write!(f, "Unknown(0x{:04X})", self.0),
        }
    }
}

/// `FILETIME`: 100 ns ticks since 1601-01-01 UTC, split in two halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FileTime {
    pub low: u32,
    pub high: u32,
}

impl FileTime {
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_ticks(ticks: u64) -> Self {
        Self {
            low: (ticks & 0xFFFF_FFFF) as u32,
            high: (ticks >> 32) as u32,
        }
    }

    #[allow(clippy::cast_lossless)]
    pub const fn ticks(self) -> u64 {
        ((self.high as u64) << 32) | self.low as u64
    }

    pub const fn is_zero(self) -> bool {
        self.low == 0 && self.high == 0
    }
}

/// Interface identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl Guid {
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_u128(uuid: u128) -> Self {
        Self {
            data1: (uuid >> 96) as u32,
            data2: ((uuid >> 80) & 0xffff) as u16,
            data3: ((uuid >> 64) & 0xffff) as u16,
            data4: (uuid as u64).to_be_bytes(),
        }
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-",
            self.data1, self.data2, self.data3, self.data4[0], self.data4[1]
        )?;
        self.data4[2..]
            .iter()
            .try_for_each(|byte| write!(f, "{byte:02x}"))
    }
}

/// Current state and properties of a group, as reported by the server.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupProperties {
    /// Update rate in milliseconds (the server may revise the requested one).
    pub update_rate: u32,
    /// Whether the group is processing updates.
    pub active: bool,
    /// The group name, unique within the server connection.
    pub name: String,
    /// Time zone bias in minutes from UTC.
    pub time_bias: i32,
    /// Percent change required to report an analog value.
    pub percent_deadband: f32,
    /// Locale ID used for string values in this group.
    pub locale_id: u32,
    /// Handle assigned by the client for this group.
    pub client_handle: GroupHandle,
    /// Handle assigned by the server for this group.
    pub server_handle: GroupHandle,
}

/// Partial group state for `SetState`; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupStateChange {
    pub update_rate: Option<u32>,
    pub active: Option<bool>,
    pub time_bias: Option<i32>,
    pub percent_deadband: Option<f32>,
    pub locale_id: Option<u32>,
    pub client_handle: Option<GroupHandle>,
}

impl From<&GroupProperties> for GroupStateChange {
    fn from(props: &GroupProperties) -> Self {
        Self {
            update_rate: Some(props.update_rate),
            active: Some(props.active),
            time_bias: Some(props.time_bias),
            percent_deadband: Some(props.percent_deadband),
            locale_id: Some(props.locale_id),
            client_handle: Some(props.client_handle),
        }
    }
}

/// Definition required to add or validate an item.
///
/// # Examples
///
/// ```
/// use opc_da_access::{ItemDef, ItemHandle, VarType};
/// let def = ItemDef::new("Random.Int4", ItemHandle(1)).with_requested_type(VarType::R8);
/// assert!(def.active);
/// assert_eq!(def.requested_type, VarType::R8);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemDef {
    /// Optional access path for the item (server-specific).
    pub access_path: String,
    /// The identifier of the tag within the server namespace.
    pub item_id: String,
    /// Whether the item is added in an active state.
    pub active: bool,
    /// Handle assigned by the client for this item.
    pub client_handle: ItemHandle,
    /// Requested data type (`EMPTY` for the server's canonical type).
    pub requested_type: VarType,
    /// Optional opaque blob for the item.
    pub blob: Vec<u8>,
}

impl ItemDef {
    /// An active item requesting the canonical type.
    pub fn new(item_id: impl Into<String>, client_handle: ItemHandle) -> Self {
        Self {
            item_id: item_id.into(),
            active: true,
            client_handle,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_access_path(mut self, access_path: impl Into<String>) -> Self {
        self.access_path = access_path.into();
        self
    }

    #[must_use]
    pub const fn with_requested_type(mut self, requested_type: VarType) -> Self {
        self.requested_type = requested_type;
        self
    }

    #[must_use]
    pub const fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    #[must_use]
    pub fn with_blob(mut self, blob: Vec<u8>) -> Self {
        self.blob = blob;
        self
    }
}

/// Outcome of adding or validating one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemResult {
    /// Client handle of the matching input definition.
    pub client_handle: ItemHandle,
    /// Server handle; present only when the item succeeded.
    pub server_handle: Option<ItemHandle>,
    /// Canonical data type the server stores the item in.
    pub canonical_type: VarType,
    pub access_rights: AccessRights,
    pub blob: Vec<u8>,
    /// Per-item status.
    pub error: Hresult,
}

impl ItemResult {
    pub const fn is_ok(&self) -> bool {
        self.error.is_ok()
    }
}

/// A decoded value with its quality and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemValue {
    pub client_handle: ItemHandle,
    /// `Value::Empty` when the item failed.
    pub value: Value,
    pub quality: Quality,
    /// `None` when the server sent a zero timestamp.
    pub timestamp: Option<DateTime<Utc>>,
    /// Per-item status; a decode failure replaces a successful server status.
    pub error: Hresult,
}

impl ItemValue {
    pub const fn is_ok(&self) -> bool {
        self.error.is_ok()
    }
}

/// One entry of the native add/validate result buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeItemResult {
    pub server_handle: ItemHandle,
    pub canonical_type: VarType,
    pub access_rights: u32,
    pub blob: Vec<u8>,
}

/// One entry of the native synchronous read buffer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NativeItemState {
    pub client_handle: ItemHandle,
    pub timestamp: FileTime,
    pub quality: u16,
    pub value: Variant,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_display_all_cases() {
        assert_eq!(Quality(0xC0).to_string(), "Good");
        assert_eq!(Quality(0x00).to_string(), "Bad");
        assert_eq!(Quality(0x40).to_string(), "Uncertain");
        assert_eq!(Quality(0xC4).to_string(), "Good");
        assert_eq!(Quality(0x04).to_string(), "Bad");
        assert_eq!(Quality(0x80).to_string(), "Unknown(0x0080)");
    }

    #[test]
    fn test_quality_fields() {
        let q = Quality(0x1C | 0x02);
        assert_eq!(q.status(), QualityStatus::Bad);
        assert_eq!(q.substatus(), 7);
        assert_eq!(q.limit(), 2);
        assert!(!q.is_good());
        assert_eq!(Quality(0x12C0).vendor(), 0x12);
    }

    #[test]
    fn test_hresult_classification() {
        assert!(Hresult::S_OK.is_ok());
        assert!(Hresult::S_FALSE.is_ok());
        assert!(Hresult::OPC_S_UNSUPPORTEDRATE.is_ok());
        assert!(Hresult::E_FAIL.is_err());
        assert!(Hresult::OPC_E_BADTYPE.is_err());
        assert_eq!(Hresult::E_FAIL.to_string(), "0x80004005");
        assert_eq!(format!("{:?}", Hresult::S_OK), "Hresult(0x00000000)");
    }

    #[test]
    fn test_var_type_modifiers() {
        let vt = VarType::I4.array_of();
        assert!(vt.is_array());
        assert!(!vt.is_byref());
        assert_eq!(vt.base(), VarType::I4);
        assert_eq!(vt.to_string(), "ARRAY|I4");
        assert_eq!(VarType(0x4003).to_string(), "BYREF|I4");
        assert_eq!(VarType(0x0FFF).to_string(), "VT(0x0FFF)");
    }

    #[test]
    fn test_filetime_ticks() {
        let ft = FileTime::from_ticks(0x0123_4567_89AB_CDEF);
        assert_eq!(ft.high, 0x0123_4567);
        assert_eq!(ft.low, 0x89AB_CDEF);
        assert_eq!(ft.ticks(), 0x0123_4567_89AB_CDEF);
        assert!(FileTime::default().is_zero());
    }

    #[test]
    fn test_guid_display() {
        let iid = Guid::from_u128(0x39c1_3a70_011e_11d0_9675_0020_afd8_adb3);
        assert_eq!(iid.to_string(), "39c13a70-011e-11d0-9675-0020afd8adb3");
    }

    #[test]
    fn test_item_def_builder() {
        let def = ItemDef::new("Bucket.Int2", ItemHandle(9))
            .with_access_path("plc1")
            .with_active(false)
            .with_blob(vec![1, 2]);
        assert_eq!(def.item_id, "Bucket.Int2");
        assert_eq!(def.access_path, "plc1");
        assert_eq!(def.client_handle, ItemHandle(9));
        assert!(!def.active);
        assert_eq!(def.requested_type, VarType::EMPTY);
        assert_eq!(def.blob, vec![1, 2]);
    }

    #[test]
    fn test_access_rights() {
        assert!(AccessRights::READ_WRITE.is_readable());
        assert!(AccessRights::READ_WRITE.is_writeable());
        assert!(!AccessRights::READABLE.is_writeable());
    }
}
