use super::{Control, State, Stride};
use crate::action::{self, Events, StepProps};
use crate::matcher::{Bindings, Matcher};
use crate::spec::{Branch, BranchKind, Branches, Spec};
use crate::types::{Error, Result};
use serde_json::{json, Value};
use std::borrow::Cow;
use tokio_util::sync::CancellationToken;

impl Spec {
    /// Attempt one transition from `state`.
    ///
    /// `pending` is the next unconsumed message, if any. The returned stride
    /// has `to == None` when no branch applied.
    pub fn step(
        &self,
        ctx: &CancellationToken,
        state: &State,
        pending: Option<&Value>,
        control: &Control,
        props: &StepProps,
    ) -> Result<Stride> {
        let mut stride = Stride::new(state.clone());
        self.step_into(ctx, state, pending, control, props, &mut stride)?;
        Ok(stride)
    }

    /// Like [`Spec::step`] but records into a caller-owned stride, so a
    /// failing step still reports what it consumed.
    pub(super) fn step_into(
        &self,
        ctx: &CancellationToken,
        state: &State,
        pending: Option<&Value>,
        control: &Control,
        props: &StepProps,
        stride: &mut Stride,
    ) -> Result<()> {
        if !self.is_compiled() {
            return Err(Error::SpecNotCompiled(self.name.clone()));
        }
        let node = self
            .node(&state.node)
            .ok_or_else(|| Error::UnknownNode(state.node.clone()))?;

        let kind = node.branches.as_ref().map(Branches::kind).transpose()?;

        let mut bs = state.bs.clone();

        if node.action.is_some() {
            if kind == Some(BranchKind::Message) {
                return Err(Error::BadBranching(state.node.clone()));
            }
            let action = node
                .compiled_action()
                .ok_or_else(|| Error::UncompiledAction(state.node.clone()))?;

            match action::run(action.as_ref(), ctx, &bs, props) {
                Ok(exe) => {
                    if let Some(out) = exe.bindings {
                        bs = out;
                    }
                    absorb(&mut stride.events, exe.events, control);
                }
                Err(err) => {
                    let text = Value::String(err.to_string());
                    bs.insert("actionError".to_string(), text.clone());
                    bs.insert("error".to_string(), text);
                    if !self.action_error_branches {
                        return Err(err);
                    }
                }
            }
        }

        let (Some(branches), Some(kind)) = (node.branches.as_ref(), kind) else {
            return Ok(());
        };

        if control.traces {
            stride.events.trace(json!({
                "consider": state.node,
                "bs": bs,
                "pending": pending,
            }));
        }

        let against: Cow<'_, Value> = match kind {
            BranchKind::Message => match pending {
                Some(message) => {
                    stride.consumed = Some(message.clone());
                    Cow::Borrowed(message)
                }
                None => return Ok(()),
            },
            BranchKind::Bindings => Cow::Owned(bs.clone().into_value()),
        };

        for branch in &branches.branches {
            if let Some(to) = try_branch(ctx, branch, &bs, &against, props, control, &mut stride.events)? {
                stride.to = Some(to);
                break;
            }
        }
        Ok(())
    }
}

fn try_branch(
    ctx: &CancellationToken,
    branch: &Branch,
    bs: &Bindings,
    against: &Value,
    props: &StepProps,
    control: &Control,
    events: &mut Events,
) -> Result<Option<State>> {
    let candidates = match branch.compiled_pattern() {
        Some(pattern) => Matcher::default().match_with(pattern, against, bs)?,
        None => vec![bs.clone()],
    };

    if control.traces {
        events.trace(json!({"try": branch.target, "bss": candidates}));
    }

    let chosen = match branch.compiled_guard() {
        None => match candidates.len() {
            0 => None,
            1 => candidates.into_iter().next(),
            n => return Err(Error::TooManyBindings(n)),
        },
        Some(guard) => {
            let mut chosen = None;
            for candidate in candidates {
                let exe = action::run(guard.as_ref(), ctx, &candidate, props)?;
                if control.traces {
                    events.traces.extend(exe.events.traces);
                }
                if let Some(guarded) = exe.bindings {
                    chosen = Some(guarded);
                    break;
                }
            }
            chosen
        }
    };

    Ok(chosen.map(|bs| {
        let target = resolve_target(&branch.target, &bs);
        State::new(target, bs)
    }))
}

/// `@var` names the node held in binding `var`; anything else is literal.
fn resolve_target(target: &str, bs: &Bindings) -> String {
    if let Some(var) = target.strip_prefix('@') {
        if let Some(Value::String(node)) = bs.get(var) {
            return node.clone();
        }
    }
    target.to_string()
}

fn absorb(into: &mut Events, events: Events, control: &Control) {
    into.emitted.extend(events.emitted);
    if control.traces {
        into.traces.extend(events.traces);
    }
}
