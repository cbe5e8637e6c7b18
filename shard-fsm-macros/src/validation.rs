//! Validation logic for FSM structure.

use std::collections::HashMap;
use std::time::Duration;

use darling::FromMeta;
use syn::spanned::Spanned;
use syn::{Error, FnArg, Ident, ImplItem, ImplItemFn, ItemImpl, Path, Type};

use crate::attrs::{FsmArgs, OnAttr, StateTimeoutAttr};

/// Attributes consumed by the macro and stripped from the output.
pub const FSM_ATTRS: &[&str] = &["on", "state_timeout", "on_input"];

/// One `#[on]` row bound to an action method.
#[derive(Debug, Clone)]
pub struct Row {
    pub state: Ident,
    pub event: Ident,
    pub next: Ident,
    pub action: Ident,
    pub timeout: Option<Duration>,
}

/// Represents the complete FSM structure after parsing.
#[derive(Debug)]
pub struct FsmStructure {
    pub fsm_name: Ident,
    pub state_type: Type,
    pub event_type: Type,
    pub payload_type: Type,
    pub error_type: Type,
    pub initial: Ident,
    pub terminal: Vec<Ident>,
    pub close: Option<Ident>,
    pub timeout_event: Option<Ident>,
    pub rows: Vec<Row>,
    pub on_input: Option<Ident>,
}

impl FsmStructure {
    /// Parse the impl block and extract FSM structure.
    pub fn parse(args: FsmArgs, impl_block: &ItemImpl) -> syn::Result<Self> {
        if !impl_block.generics.params.is_empty() {
            return Err(Error::new_spanned(
                &impl_block.generics,
                "generic FSM types are not supported",
            ));
        }
        if let Some((_, path, _)) = &impl_block.trait_ {
            return Err(Error::new_spanned(path, "#[fsm] expects an inherent impl block"));
        }

        let fsm_name = match &*impl_block.self_ty {
            Type::Path(path) => path
                .path
                .segments
                .last()
                .ok_or_else(|| Error::new_spanned(&impl_block.self_ty, "Expected FSM type name"))?
                .ident
                .clone(),
            _ => return Err(Error::new_spanned(&impl_block.self_ty, "Expected type path for FSM")),
        };

        let mut state_type = None;
        let mut event_type = None;
        let mut payload_type = None;
        let mut error_type = None;
        for item in &impl_block.items {
            if let ImplItem::Type(ty) = item {
                let slot = match ty.ident.to_string().as_str() {
                    "State" => &mut state_type,
                    "Event" => &mut event_type,
                    "Payload" => &mut payload_type,
                    "Error" => &mut error_type,
                    _ => {
                        return Err(Error::new_spanned(
                            &ty.ident,
                            "unexpected associated type; expected State, Event, Payload or Error",
                        ));
                    }
                };
                *slot = Some(ty.ty.clone());
            }
        }
        let missing = |name: &str| {
            Error::new_spanned(
                &impl_block.self_ty,
                format!("Missing associated type: type {name} = ..."),
            )
        };
        let state_type = state_type.ok_or_else(|| missing("State"))?;
        let event_type = event_type.ok_or_else(|| missing("Event"))?;
        let payload_type = payload_type.ok_or_else(|| missing("Payload"))?;
        let error_type = error_type.ok_or_else(|| missing("Error"))?;

        let mut rows = Vec::new();
        let mut seen: HashMap<(String, String), Ident> = HashMap::new();
        let mut on_input = None;

        for item in &impl_block.items {
            let ImplItem::Fn(method) = item else { continue };
            let parsed = MethodAttrs::parse(method)?;

            if parsed.on_input {
                if on_input.is_some() {
                    return Err(Error::new_spanned(
                        &method.sig.ident,
                        "only one #[on_input] method is allowed",
                    ));
                }
                check_input_signature(method)?;
                on_input = Some(method.sig.ident.clone());
            }

            if parsed.rows.is_empty() {
                if let Some(timeout) = &parsed.timeout_attr {
                    return Err(Error::new_spanned(
                        &timeout.duration,
                        "#[state_timeout] requires at least one #[on] row",
                    ));
                }
                continue;
            }
            check_action_signature(method)?;

            let timeout = parsed
                .timeout_attr
                .as_ref()
                .map(|attr| {
                    humantime::parse_duration(&attr.duration.value()).map_err(|e| {
                        Error::new_spanned(&attr.duration, format!("invalid duration: {e}"))
                    })
                })
                .transpose()?;

            for on in parsed.rows {
                let state = single_ident(&on.state)?;
                let event = single_ident(&on.event)?;
                let next = single_ident(&on.next)?;
                let key = (state.to_string(), event.to_string());
                if let Some(previous) = seen.get(&key) {
                    return Err(Error::new(
                        on.state.span(),
                        format!(
                            "transition ({state}, {event}) is already handled by `{previous}`"
                        ),
                    ));
                }
                seen.insert(key, method.sig.ident.clone());
                rows.push(Row {
                    state,
                    event,
                    next,
                    action: method.sig.ident.clone(),
                    timeout,
                });
            }
        }

        if rows.is_empty() {
            return Err(Error::new_spanned(
                &impl_block.self_ty,
                "an FSM needs at least one #[on(state = .., event = .., next = ..)] action",
            ));
        }

        let timeout_event = args.timeout_event.as_ref().map(single_ident).transpose()?;
        if timeout_event.is_none() && rows.iter().any(|row| row.timeout.is_some()) {
            return Err(Error::new_spanned(
                &impl_block.self_ty,
                "#[state_timeout] needs `timeout_event = ..` in #[fsm(..)]",
            ));
        }

        Ok(Self {
            fsm_name,
            state_type,
            event_type,
            payload_type,
            error_type,
            initial: single_ident(&args.initial)?,
            terminal: args.terminal.iter().map(single_ident).collect::<syn::Result<_>>()?,
            close: args.close.as_ref().map(single_ident).transpose()?,
            timeout_event,
            rows,
            on_input,
        })
    }
}

struct MethodAttrs {
    rows: Vec<OnAttr>,
    timeout_attr: Option<StateTimeoutAttr>,
    on_input: bool,
}

impl MethodAttrs {
    fn parse(method: &ImplItemFn) -> syn::Result<Self> {
        let mut rows = Vec::new();
        let mut timeout_attr = None;
        let mut on_input = false;

        for attr in &method.attrs {
            if attr.path().is_ident("on") {
                rows.push(OnAttr::from_meta(&attr.meta)?);
            } else if attr.path().is_ident("state_timeout") {
                if timeout_attr.is_some() {
                    return Err(Error::new_spanned(attr, "duplicate #[state_timeout]"));
                }
                timeout_attr = Some(StateTimeoutAttr::from_meta(&attr.meta)?);
            } else if attr.path().is_ident("on_input") {
                on_input = true;
            }
        }

        if on_input && !rows.is_empty() {
            return Err(Error::new_spanned(
                &method.sig.ident,
                "#[on_input] cannot be combined with #[on]",
            ));
        }

        Ok(Self {
            rows,
            timeout_attr,
            on_input,
        })
    }
}

/// Actions take `&mut self`, the session context and the payload.
fn check_action_signature(method: &ImplItemFn) -> syn::Result<()> {
    let sig = &method.sig;
    if sig.asyncness.is_some() {
        return Err(Error::new_spanned(sig.asyncness, "actions must not be async"));
    }
    match sig.inputs.first() {
        Some(FnArg::Receiver(receiver))
            if receiver.reference.is_some() && receiver.mutability.is_some() => {}
        _ => {
            return Err(Error::new_spanned(
                &sig.ident,
                "actions must take `&mut self` as their first argument",
            ));
        }
    }
    if sig.inputs.len() != 3 {
        return Err(Error::new_spanned(
            &sig.inputs,
            "actions take (&mut self, cx: &mut SessionContext<'_, Self>, payload)",
        ));
    }
    Ok(())
}

fn check_input_signature(method: &ImplItemFn) -> syn::Result<()> {
    let sig = &method.sig;
    if sig.receiver().is_some() || sig.inputs.len() != 1 {
        return Err(Error::new_spanned(
            &sig.inputs,
            "#[on_input] methods take only `bytes: &[u8]`",
        ));
    }
    Ok(())
}

fn single_ident(path: &Path) -> syn::Result<Ident> {
    path.get_ident()
        .cloned()
        .ok_or_else(|| Error::new_spanned(path, "expected a bare variant name"))
}
