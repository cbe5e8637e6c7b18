//! `#[derive(FsmId)]` for fieldless enums.

use proc_macro2::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Error, Fields};

pub fn expand(input: &DeriveInput) -> syn::Result<TokenStream> {
    let name = &input.ident;
    if !input.generics.params.is_empty() {
        return Err(Error::new_spanned(&input.generics, "FsmId enums cannot be generic"));
    }
    let Data::Enum(data) = &input.data else {
        return Err(Error::new_spanned(name, "FsmId can only be derived for enums"));
    };
    if data.variants.is_empty() {
        return Err(Error::new_spanned(name, "FsmId needs at least one variant"));
    }

    let mut arms = Vec::with_capacity(data.variants.len());
    for (index, variant) in data.variants.iter().enumerate() {
        if !matches!(variant.fields, Fields::Unit) {
            return Err(Error::new_spanned(
                &variant.fields,
                "FsmId variants cannot carry data; put it in the payload",
            ));
        }
        let ident = &variant.ident;
        arms.push(quote! { #name::#ident => #index, });
    }
    let count = arms.len();

    Ok(quote! {
        impl ::shard_fsm::FsmId for #name {
            const COUNT: usize = #count;

            fn index(self) -> usize {
                match self {
                    #(#arms)*
                }
            }
        }
    })
}
