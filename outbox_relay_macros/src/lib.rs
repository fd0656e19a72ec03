mod payload;

use proc_macro::TokenStream;

// ============================================================================
// #[derive(EventPayload)]
// ============================================================================

/// Derive macro that implements `outbox_relay::EventPayload` for a struct.
///
/// The struct-level `#[event(...)]` attribute names the event and the
/// aggregate it belongs to:
///
/// ```ignore
/// #[derive(Serialize, Deserialize, EventPayload)]
/// #[serde(rename_all = "camelCase")]
/// #[event(name = "InvoiceCreated", aggregate = "invoice", id = invoice_id)]
/// pub struct InvoiceCreated {
///     pub invoice_id: u64,
///     pub client_id: u64,
///     pub amount: Decimal,
/// }
/// ```
///
/// Supported keys:
/// - `name = "..."` (required): the detail type on the wire
/// - `aggregate = "..."` (required): aggregate type of the owning entity
/// - `id = field` (required): field whose `ToString` value is the aggregate id
/// - `version = N`: payload schema version, defaults to `1`
#[proc_macro_derive(EventPayload, attributes(event))]
pub fn derive_event_payload(input: TokenStream) -> TokenStream {
    payload::derive_event_payload(input)
}
