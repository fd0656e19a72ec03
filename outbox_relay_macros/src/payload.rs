use proc_macro::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields, Ident, LitInt, LitStr};

struct EventAttrs {
    name: LitStr,
    aggregate: LitStr,
    id_field: Ident,
    version: Option<LitInt>,
}

pub fn derive_event_payload(input: TokenStream) -> TokenStream {
    let input = syn::parse_macro_input!(input as DeriveInput);
    match expand(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let ident = &input.ident;
    let attrs = parse_struct_attrs(input)?;

    // The id field has to exist on a struct with named fields
    let fields = match &input.data {
        Data::Struct(data_struct) => match &data_struct.fields {
            Fields::Named(fields) => &fields.named,
            _ => {
                return Err(syn::Error::new_spanned(
                    ident,
                    "EventPayload derive only supports structs with named fields",
                ))
            }
        },
        _ => {
            return Err(syn::Error::new_spanned(
                ident,
                "EventPayload derive only supports structs",
            ))
        }
    };

    let id_field = &attrs.id_field;
    let has_id_field = fields
        .iter()
        .any(|field| field.ident.as_ref() == Some(id_field));
    if !has_id_field {
        return Err(syn::Error::new_spanned(
            id_field,
            format!("no field named `{}` on `{}`", id_field, ident),
        ));
    }

    let name = &attrs.name;
    let aggregate = &attrs.aggregate;
    let version = match &attrs.version {
        Some(version) => quote! { #version },
        None => quote! { 1 },
    };

    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics ::outbox_relay::EventPayload for #ident #ty_generics #where_clause {
            const EVENT_TYPE: &'static str = #name;
            const AGGREGATE_TYPE: &'static str = #aggregate;
            const SCHEMA_VERSION: u32 = #version;

            fn aggregate_id(&self) -> ::std::string::String {
                ::std::string::ToString::to_string(&self.#id_field)
            }
        }
    })
}

fn parse_struct_attrs(input: &DeriveInput) -> syn::Result<EventAttrs> {
    let mut name: Option<LitStr> = None;
    let mut aggregate: Option<LitStr> = None;
    let mut id_field: Option<Ident> = None;
    let mut version: Option<LitInt> = None;

    for attr in &input.attrs {
        if !attr.path().is_ident("event") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("name") {
                name = Some(meta.value()?.parse()?);
                Ok(())
            } else if meta.path.is_ident("aggregate") {
                aggregate = Some(meta.value()?.parse()?);
                Ok(())
            } else if meta.path.is_ident("id") {
                id_field = Some(meta.value()?.parse()?);
                Ok(())
            } else if meta.path.is_ident("version") {
                version = Some(meta.value()?.parse()?);
                Ok(())
            } else {
                Err(meta.error("unsupported key, expected one of: name, aggregate, id, version"))
            }
        })?;
    }

    let missing = |key: &str| {
        syn::Error::new_spanned(
            &input.ident,
            format!("missing `{}` in #[event(...)] attribute", key),
        )
    };

    Ok(EventAttrs {
        name: name.ok_or_else(|| missing("name"))?,
        aggregate: aggregate.ok_or_else(|| missing("aggregate"))?,
        id_field: id_field.ok_or_else(|| missing("id"))?,
        version,
    })
}
