//! Code generation for the `Machine` implementation.

use proc_macro2::TokenStream;
use quote::quote;
use syn::{ImplItem, ItemImpl};

use crate::validation::{FSM_ATTRS, FsmStructure, Row};

/// Generate the inherent impl (attributes stripped) plus the `Machine` impl.
pub fn generate(fsm: &FsmStructure, original_impl: &ItemImpl) -> TokenStream {
    let inherent = strip_fsm_items(original_impl);
    let machine_impl = generate_machine_impl(fsm);

    quote! {
        #inherent
        #machine_impl
    }
}

/// Keep user methods and constants, drop the associated types and the
/// attributes this macro consumed.
fn strip_fsm_items(original_impl: &ItemImpl) -> ItemImpl {
    let mut inherent = original_impl.clone();
    inherent.items.retain(|item| !matches!(item, ImplItem::Type(_)));
    for item in &mut inherent.items {
        if let ImplItem::Fn(method) = item {
            method
                .attrs
                .retain(|attr| !FSM_ATTRS.iter().any(|name| attr.path().is_ident(name)));
        }
    }
    inherent
}

fn generate_machine_impl(fsm: &FsmStructure) -> TokenStream {
    let fsm_name = &fsm.fsm_name;
    let state_type = &fsm.state_type;
    let event_type = &fsm.event_type;
    let payload_type = &fsm.payload_type;
    let error_type = &fsm.error_type;
    let initial = &fsm.initial;

    let rows = fsm.rows.iter().map(|row| generate_row(fsm, row));
    let terminal = fsm.terminal.iter().map(|state| {
        quote! { builder.terminal(#state_type::#state)?; }
    });
    let close = fsm.close.as_ref().map(|state| {
        quote! { builder.on_close(#state_type::#state)?; }
    });
    let timeout_event = fsm.timeout_event.as_ref().map(|event| {
        quote! { builder.timeout_event(#event_type::#event)?; }
    });
    let on_input = fsm.on_input.as_ref().map(|method| {
        quote! {
            fn on_input(bytes: &[u8]) -> ::core::option::Option<(#event_type, #payload_type)> {
                #fsm_name::#method(bytes)
            }
        }
    });

    quote! {
        impl ::shard_fsm::Machine for #fsm_name {
            type State = #state_type;
            type Event = #event_type;
            type Payload = #payload_type;
            type Error = #error_type;

            fn transition_table() -> ::core::result::Result<
                ::shard_fsm::FiniteStateMachine<Self>,
                ::shard_fsm::FsmError,
            > {
                let mut builder = ::shard_fsm::FsmBuilder::<Self>::new(#state_type::#initial);
                #(#rows)*
                #(#terminal)*
                #close
                #timeout_event
                builder.build()
            }

            #on_input
        }
    }
}

fn generate_row(fsm: &FsmStructure, row: &Row) -> TokenStream {
    let fsm_name = &fsm.fsm_name;
    let state_type = &fsm.state_type;
    let event_type = &fsm.event_type;
    let Row {
        state,
        event,
        next,
        action,
        timeout,
    } = row;

    match timeout {
        Some(duration) => {
            let secs = duration.as_secs();
            let nanos = duration.subsec_nanos();
            quote! {
                builder.define_with_timeout(
                    #state_type::#state,
                    #event_type::#event,
                    #fsm_name::#action,
                    #state_type::#next,
                    ::std::time::Duration::new(#secs, #nanos),
                )?;
            }
        }
        None => quote! {
            builder.define(
                #state_type::#state,
                #event_type::#event,
                #fsm_name::#action,
                #state_type::#next,
            )?;
        },
    }
}
