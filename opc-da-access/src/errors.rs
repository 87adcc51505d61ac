use crate::typedefs::Hresult;
use thiserror::Error;

/// Result type alias for group and item operations.
pub type OpcResult<T> = Result<T, OpcError>;

/// Call-level failures of the data-access engine.
///
/// Per-item failures never surface here; they stay inside the returned
/// result sequences as [`Hresult`] codes.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OpcError {
    /// The group was disposed before the call.
    #[error("Group has been disposed")]
    Disposed,

    /// The native group lacks the asynchronous I/O or notification interface.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Inputs rejected before any native call was made.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The native call itself returned a failure status.
    #[error("{operation} failed with {code} ({})", .code.hint().unwrap_or("No hint available"))]
    Native {
        operation: &'static str,
        code: Hresult,
    },

    /// A native buffer did not have the shape the call promised.
    #[error("Data conversion failed: {0}")]
    Conversion(String),

    /// Catch-all for collaborator failures.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl OpcError {
    /// Builds a [`OpcError::Native`] for the named operation.
    pub const fn native(operation: &'static str, code: Hresult) -> Self {
        Self::Native { operation, code }
    }

    /// Returns the native status code, if this error carries one.
    pub const fn code(&self) -> Option<Hresult> {
        match self {
            Self::Native { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for OpcError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<std::num::TryFromIntError> for OpcError {
    fn from(err: std::num::TryFromIntError) -> Self {
        Self::InvalidArgument(format!("Item count exceeds the native limit: {err}"))
    }
}

/// Formats an HRESULT with its hint, when one is known.
pub fn format_hresult(hr: Hresult) -> String {
    match friendly_hresult_hint(hr) {
        Some(hint) => format!("{hr}: {hint}"),
        None => hr.to_string(),
    }
}

/// Maps known COM and OPC status codes to actionable hints.
pub const fn friendly_hresult_hint(hr: Hresult) -> Option<&'static str> {
    match hr.as_u32() {
        0x8000_4001 => Some("Not implemented by the server (E_NOTIMPL)"),
        0x8000_4002 => Some("Interface not supported by the server object (E_NOINTERFACE)"),
        0x8000_4003 => Some("Invalid pointer (E_POINTER)"),
        0x8000_4005 => Some("Unspecified server failure (E_FAIL)"),
        0x8007_0057 => Some("The server rejected one of the arguments (E_INVALIDARG)"),
        0x8007_0005 => {
            Some("Access denied: DCOM launch/activation permissions not configured for this user")
        }
        0x8007_06BA => Some("RPC server unavailable: the host may be offline or blocking RPC"),
        0x8002_0005 => Some("Value type does not match the item type (DISP_E_TYPEMISMATCH)"),
        0x8002_0008 => Some("Variant type is not supported (DISP_E_BADVARTYPE)"),
        0x8002_000A => Some("Value is out of range for its type (DISP_E_OVERFLOW)"),
        0x8004_0200 => Some("Connection point is not advised (CONNECT_E_NOCONNECTION)"),
        0xC004_0001 => Some("Server handle is not valid for this group (OPC_E_INVALIDHANDLE)"),
        0xC004_0004 => {
            Some("Data type mismatch: server cannot convert the value (OPC_E_BADTYPE)")
        }
        0xC004_0006 => Some("Server rejected the access: the item may be read-only (OPC_E_BADRIGHTS)"),
        0xC004_0007 => Some("Item ID not found in server address space (OPC_E_UNKNOWNITEMID)"),
        0xC004_0008 => Some("Item ID syntax is invalid for this server (OPC_E_INVALIDITEMID)"),
        0xC004_000A => Some("Access path is not known to the server (OPC_E_UNKNOWNPATH)"),
        0xC004_000B => Some("Value is out of range for the item (OPC_E_RANGE)"),
        0xC004_000C => Some("Group name is already in use (OPC_E_DUPLICATENAME)"),
        0x0004_000D => Some("Server revised the requested update rate (OPC_S_UNSUPPORTEDRATE)"),
        0x0004_000E => Some("Value was written but clamped by the server (OPC_S_CLAMP)"),
        _ => None,
    }
}
