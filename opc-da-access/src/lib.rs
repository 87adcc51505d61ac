//! # opc-da-access
//!
//! The group and item access engine of an OPC DA client: bulk item
//! management, synchronous and asynchronous reads and writes, and typed
//! server notifications, over explicit native interface traits.
//!
//! ## Features
//! - `com-backend` (default): `native::com`, the Windows COM implementation
//!   of the native interfaces via `windows` and `opc_da_bindings`
//! - `test-support`: exports the in-memory `fake` native group and
//!   `MockGroupOwner` via `mockall`

pub mod codec;
pub mod errors;
pub mod events;
pub mod group;
pub mod memory;
pub mod native;
pub mod reader;
pub mod typedefs;
pub mod variant;

mod dispatcher;

#[cfg(any(test, feature = "test-support"))]
pub mod fake;

// Stable public API
pub use errors::{OpcError, OpcResult, format_hresult, friendly_hresult_hint};
pub use events::{
    CancelCompleteEvent, DataChangeEvent, GroupEvent, HandlerId, ReadCompleteEvent,
    WriteCompleteEvent,
};
pub use group::{AsyncRequest, Group, GroupOwner, GroupParams};
pub use memory::RemoteArray;
pub use native::NativeGroupObject;
pub use typedefs::{
    AccessRights, DataSource, FileTime, GroupHandle, GroupProperties, GroupStateChange, Guid,
    Hresult, ItemDef, ItemHandle, ItemResult, ItemValue, Quality, QualityStatus, VarType,
};
pub use variant::{ArrayValue, Currency, Value};

// Backend re-exports (conditional)
#[cfg(all(windows, feature = "com-backend"))]
pub use native::com::{ComApartment, ComGroupObject};

// Test support re-export
#[cfg(feature = "test-support")]
pub use group::MockGroupOwner;
