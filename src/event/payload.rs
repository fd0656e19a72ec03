use serde::de::DeserializeOwned;
use serde::Serialize;

/// A typed, schema-versioned event body.
///
/// Usually derived:
///
/// ```ignore
/// #[derive(Serialize, Deserialize, EventPayload)]
/// #[serde(rename_all = "camelCase")]
/// #[event(name = "OrderCreated", aggregate = "order", id = order_id)]
/// pub struct OrderCreated { pub order_id: u64, pub client_id: u64, pub amount: Decimal }
/// ```
pub trait EventPayload: Serialize + DeserializeOwned {
    /// Detail type on the wire (e.g. `"InvoiceCreated"`).
    const EVENT_TYPE: &'static str;
    /// Type of the aggregate that owns the event (e.g. `"invoice"`).
    const AGGREGATE_TYPE: &'static str;
    /// Current schema version written by this code.
    const SCHEMA_VERSION: u32;

    /// Identifier of the owning aggregate instance.
    fn aggregate_id(&self) -> String;
}
