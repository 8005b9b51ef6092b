//! Finish scopes
//!
//! A finish task owns a latch that starts at one (its own reference). Every
//! task created inside the scope increments the latch before creation returns
//! and decrements it on completion, after forwarding its result. The finish
//! task drops its own reference when its body returns.
//!
//! The scope's continuation is an ordinary task with two slots: slot 0 waits
//! on the latch, slot 1 receives the finish task's return value. When it runs
//! it satisfies the scope's output event and then decrements the enclosing
//! scope, so a parent never observes a child scope as done before its output
//! is visible.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::RuntimeResult;
use crate::runtime::context::TaskContext;
use crate::runtime::datablock::AccessMode;
use crate::runtime::event::{EventKind, LATCH_DECR_SLOT};
use crate::runtime::guid::{Guid, Object};
use crate::runtime::task::{Arity, Dependency, FinishScope, TaskProperties, TaskSpec, Template};
use crate::runtime::Runtime;

const CONTINUATION_NAME: &str = "finish-continuation";

/// Template run when a finish scope drains: params are `[output, parent]`.
pub(super) fn continuation_template(guid: Guid) -> Template {
    Template::new(
        guid,
        CONTINUATION_NAME,
        Arity::Fixed(2),
        Arity::Fixed(2),
        Arc::new(run_continuation),
    )
}

fn run_continuation(
    ctx: &TaskContext<'_>,
    params: &[u64],
    deps: &[Dependency],
) -> RuntimeResult<Guid> {
    let runtime = ctx.runtime();
    let param = |i: usize| params.get(i).copied().map_or(Guid::NULL, Guid::from_raw);
    let output = param(0);
    let parent = param(1);
    let value = deps.get(1).map_or(Guid::NULL, Dependency::guid);

    if !output.is_null() {
        runtime.forward_result(value, output, 0);
    }
    if !parent.is_null() {
        runtime.satisfy(parent, Guid::NULL, LATCH_DECR_SLOT)?;
    }
    debug!(task = %ctx.task(), %output, %value, "finish scope closed");
    Ok(Guid::NULL)
}

impl Runtime {
    /// Create the latch and continuation of a new finish scope.
    pub(crate) fn open_scope(
        &self,
        output: Option<Guid>,
        parent: Option<Guid>,
    ) -> RuntimeResult<FinishScope> {
        let latch = self.new_event(EventKind::Latch, 1, true)?;
        let spec = TaskSpec {
            params: vec![
                output.unwrap_or(Guid::NULL).raw(),
                parent.unwrap_or(Guid::NULL).raw(),
            ],
            slots: 2,
            properties: TaskProperties::Ordinary,
            finish_parent: None,
            scope: None,
            output_event: None,
        };
        let continuation = match self.spawn_task(self.continuation_template().clone(), spec) {
            Ok(task) => task.guid(),
            Err(e) => {
                let _ = self.registry().remove(latch);
                return Err(e);
            }
        };
        let scope = FinishScope { latch, continuation };
        if let Err(e) = self.add_dependency(latch, continuation, 0, AccessMode::Null) {
            self.abort_scope(scope);
            return Err(e);
        }
        debug!(%latch, %continuation, "finish scope opened");
        Ok(scope)
    }

    /// Tear down a scope whose finish task was never created.
    ///
    /// The continuation is cancelled without running, so neither the output
    /// event nor the enclosing scope hears from it.
    pub(crate) fn abort_scope(
        &self,
        scope: FinishScope,
    ) {
        if let Ok(Object::Event(latch)) = self.registry().remove(scope.latch) {
            latch.abandon();
        }
        if let Err(e) = self.destroy(scope.continuation) {
            warn!(continuation = %scope.continuation, error = %e, "could not cancel scope continuation");
        }
        debug!(latch = %scope.latch, continuation = %scope.continuation, "finish scope aborted");
    }
}
