//! Proc macros declaring shard-fsm transition tables.

use darling::FromMeta;
use darling::ast::NestedMeta;
use proc_macro::TokenStream;
use syn::{DeriveInput, ItemImpl, parse_macro_input};

mod attrs;
mod codegen;
mod derive;
mod validation;

/// Generates a `Machine` implementation from an annotated impl block.
///
/// ```ignore
/// #[fsm(initial = Idle, terminal(Closed), close = Closed, timeout_event = Timeout)]
/// impl Door {
///     type State = DoorState;
///     type Event = DoorEvent;
///     type Payload = ();
///     type Error = DoorError;
///
///     #[on(state = Idle, event = Open, next = Opening)]
///     #[state_timeout(duration = "5s")]
///     fn open(&mut self, cx: &mut SessionContext<'_, Self>, _: ()) -> ActionResult<Self> {
///         Ok(Transition::Next)
///     }
/// }
/// ```
#[proc_macro_attribute]
pub fn fsm(args: TokenStream, input: TokenStream) -> TokenStream {
    let input_impl = parse_macro_input!(input as ItemImpl);

    let args = match NestedMeta::parse_meta_list(args.into()) {
        Ok(list) => list,
        Err(e) => return darling::Error::from(e).write_errors().into(),
    };
    let fsm_args = match attrs::FsmArgs::from_list(&args) {
        Ok(parsed) => parsed,
        Err(e) => return e.write_errors().into(),
    };

    match generate_fsm(fsm_args, &input_impl) {
        Ok(tokens) => tokens.into(),
        Err(e) => e.to_compile_error().into(),
    }
}

fn generate_fsm(args: attrs::FsmArgs, input: &ItemImpl) -> syn::Result<proc_macro2::TokenStream> {
    let fsm_structure = validation::FsmStructure::parse(args, input)?;
    Ok(codegen::generate(&fsm_structure, input))
}

/// Implements `FsmId` for a fieldless enum, numbering variants in
/// declaration order.
#[proc_macro_derive(FsmId)]
pub fn derive_fsm_id(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match derive::expand(&input) {
        Ok(tokens) => tokens.into(),
        Err(e) => e.to_compile_error().into(),
    }
}
