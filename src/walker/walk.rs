use super::{Control, State, StopReason, Stride, Walked};
use crate::action::StepProps;
use crate::spec::Spec;
use serde_json::Value;
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;

impl Spec {
    /// Step repeatedly from `state`, feeding `pendings` in order.
    ///
    /// A failing step sends the machine to the error node with `error`,
    /// `lastNode` and `lastBindings` bound. The walk ends when a step makes
    /// no progress with no messages left ([`StopReason::Done`]), after
    /// `control.limit` steps ([`StopReason::Limited`]), when a breakpoint
    /// matches, or when even the error node can't be stepped
    /// ([`StopReason::InternalError`]).
    pub fn walk(
        &self,
        ctx: &CancellationToken,
        state: &State,
        pendings: Vec<Value>,
        control: &Control,
        props: &StepProps,
    ) -> Walked {
        let mut walked = Walked::new(control.limit as usize);
        let mut pendings: VecDeque<Value> = pendings.into();
        let mut st = state.clone();
        let error_node = self.error_node_name();

        for _ in 0..control.limit {
            if let Some((id, _)) = control.breakpoints.iter().find(|(_, bp)| bp(&st)) {
                walked.stopped_because = StopReason::BreakpointReached;
                walked.breakpoint = Some(id.clone());
                walked.remaining = pendings.into();
                return walked;
            }

            let mut stride = Stride::new(st.clone());
            if let Err(err) = self.step_into(ctx, &st, pendings.front(), control, props, &mut stride) {
                if err.is_internal() {
                    tracing::error!(spec = %self.name, node = %st.node, error = %err, "step failed");
                } else {
                    tracing::debug!(spec = %self.name, node = %st.node, error = %err, "step failed");
                }

                if st.node != error_node {
                    let mut bs = st.bs.clone();
                    bs.insert("error".to_string(), Value::String(err.to_string()));
                    bs.insert("lastNode".to_string(), Value::String(st.node.clone()));
                    bs.insert("lastBindings".to_string(), st.bs.clone().into_value());
                    stride.to = Some(State::new(error_node, bs));
                } else if err.is_internal() {
                    walked.strides.push(stride);
                    walked.stopped_because = StopReason::InternalError;
                    walked.error = Some(err.to_string());
                    walked.remaining = pendings.into();
                    return walked;
                }
            }

            if stride.consumed.is_some() {
                pendings.pop_front();
            }
            let to = stride.to.clone();
            walked.strides.push(stride);

            match to {
                Some(to) => st = to,
                None if pendings.is_empty() => {
                    walked.stopped_because = StopReason::Done;
                    return walked;
                }
                None => {}
            }
        }

        walked.stopped_because = StopReason::Limited;
        walked.remaining = pendings.into();
        walked
    }
}
