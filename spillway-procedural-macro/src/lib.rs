use proc_macro::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields, parse_macro_input};

/// Generate `fn metrics_set(&self) -> MetricsSet` for a struct whose fields are all
/// metrics. Each field is recorded under its own name, the variant of the
/// `MetricValue` is the type name of the field
#[proc_macro_derive(MetricsSetBuilder)]
pub fn metrics_set_derive(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    let name = input.ident;

    let inserts = insert_metrics(&input.data);

    let expanded = quote!(
        impl #name {
            fn metrics_set(&self) -> crate::metric::MetricsSet {
                let mut metrics = std::collections::BTreeMap::new();
                #inserts
                crate::metric::MetricsSet {
                    name: stringify!(#name),
                    metrics,
                }
            }
        }
    );

    expanded.into()
}

fn insert_metrics(data: &Data) -> proc_macro2::TokenStream {
    match *data {
        Data::Struct(ref ds) => match ds.fields {
            Fields::Named(ref fields) => {
                let inserts = fields.named.iter().map(|f| {
                    let name = f.ident.as_ref().unwrap();
                    let f_ty = &f.ty;
                    quote! {
                        metrics.insert(
                            stringify!(#name),
                            crate::metric::MetricValue::#f_ty(self.#name.value()),
                        );
                    }
                });
                quote! {
                    #(#inserts)*
                }
            }
            _ => panic!("MetricsSetBuilder can only be derived for structs with named fields"),
        },
        Data::Enum(_) | Data::Union(_) => {
            panic!("MetricsSetBuilder can only be derived for structs with named fields")
        }
    }
}
