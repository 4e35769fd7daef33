use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::{BoxFuture, ready};
use futures_timer::Delay;
use serde_json::Value;
use tracing::trace;

use super::controller::{
    DEFAULT_FAILURE_MESSAGE, FormInner, FormResult, ValidationTicket, read_lock, write_lock,
};
use super::diagnostics::{Diagnostics, TracingDiagnostics};
use super::field::{FieldCell, FieldHandle};
use super::schema::{Outcome, RuleContext, SchemaAdapter, ValidatorFailure, Verdict};
use crate::path::FieldPath;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum Trigger {
    Explicit,
    ValueUpdate,
}

/// What a run observed when it completed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FieldValidation {
    pub path: FieldPath,
    pub ticket: ValidationTicket,
    /// The field's errors after the run; unchanged when `applied` is false.
    pub errors: Vec<String>,
    pub valid: bool,
    /// False when a newer run superseded this one.
    pub applied: bool,
}

/// One validation run for one field.
///
/// Synchronous validators have already applied their result when the run is
/// returned ([`Self::is_settled`]); deferred ones apply when the run is
/// driven to completion.
#[must_use = "deferred validation results are only applied while the run is polled"]
pub struct ValidationRun {
    path: FieldPath,
    ticket: ValidationTicket,
    settled: bool,
    cell: Weak<FieldCell>,
    inner: BoxFuture<'static, FormResult<FieldValidation>>,
}

impl ValidationRun {
    pub fn path(&self) -> &FieldPath {
        &self.path
    }

    pub fn ticket(&self) -> ValidationTicket {
        self.ticket
    }

    pub fn is_settled(&self) -> bool {
        self.settled
    }

    /// False once a newer run (or a reset) has replaced this run's ticket.
    pub(super) fn is_current(&self) -> bool {
        self.cell
            .upgrade()
            .is_some_and(|cell| is_latest(&cell, self.ticket).unwrap_or(false))
    }
}

impl Future for ValidationRun {
    type Output = FormResult<FieldValidation>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

impl Debug for ValidationRun {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationRun")
            .field("path", &self.path)
            .field("ticket", &self.ticket)
            .field("settled", &self.settled)
            .finish_non_exhaustive()
    }
}

/// Issues the next ticket and marks the field pending.
pub(super) fn begin(cell: &FieldCell) -> FormResult<ValidationTicket> {
    let mut state = write_lock(&cell.state, "issuing validation ticket")?;
    let ticket = state.ticket.next();
    state.ticket = ticket;
    state.meta.pending = true;
    state.meta.validated = true;
    trace!(path = %cell.path, ticket = ticket.0, "validation started");
    Ok(ticket)
}

pub(super) fn start(handle: &FieldHandle, trigger: Trigger) -> FormResult<ValidationRun> {
    let cell = handle.cell.clone();
    let ticket = begin(&cell)?;
    handle.notify_form()?;

    let debounce = cell.options.debounce;
    if trigger == Trigger::ValueUpdate && !debounce.is_zero() {
        let form = handle.form.clone();
        let path = cell.path.clone();
        let weak = Arc::downgrade(&cell);
        let inner = async move {
            Delay::new(debounce).await;
            if !is_latest(&cell, ticket)? {
                trace!(path = %cell.path, ticket = ticket.0, "debounced validation superseded");
                return superseded(&cell, ticket);
            }
            let (label, outcome) = prepare(&cell, form.upgrade().as_deref())?;
            let result = outcome.resolve().await;
            finish(&cell, &form, ticket, &label, result)
        };
        return Ok(ValidationRun {
            path,
            ticket,
            settled: false,
            cell: weak,
            inner: inner.boxed(),
        });
    }

    let (label, outcome) = prepare(&cell, handle.form.upgrade().as_deref())?;
    run(cell, handle.form.clone(), ticket, label, outcome)
}

/// Builds the rule context from the current values and evaluates the
/// field's own rule, or the schema when it has none.
fn prepare(
    cell: &Arc<FieldCell>,
    form: Option<&FormInner>,
) -> FormResult<(String, Outcome<Verdict>)> {
    let (adapter, values) = match form {
        Some(form) => (form.adapter()?, FormInner::values_of(&form.cells()?)?),
        None => (
            Arc::new(SchemaAdapter::empty()),
            FormInner::values_of(std::slice::from_ref(cell))?,
        ),
    };
    prepare_with(cell, &adapter, values)
}

pub(super) fn prepare_with(
    cell: &FieldCell,
    adapter: &SchemaAdapter,
    values: Value,
) -> FormResult<(String, Outcome<Verdict>)> {
    let label = label_for(cell, adapter);
    let value = read_lock(&cell.state, "reading value for validation")?
        .value
        .clone();
    let ctx = RuleContext {
        path: cell.path.clone(),
        label: label.clone(),
        values,
    };
    Ok((label, evaluate(cell, adapter, &value, &ctx)))
}

pub(super) fn label_for(cell: &FieldCell, adapter: &SchemaAdapter) -> String {
    cell.options
        .label
        .clone()
        .or_else(|| adapter.label(&cell.path))
        .unwrap_or_else(|| cell.path.to_string())
}

fn evaluate(
    cell: &FieldCell,
    adapter: &SchemaAdapter,
    value: &Value,
    ctx: &RuleContext,
) -> Outcome<Verdict> {
    guarded(|| match &cell.options.rule {
        Some(rule) => rule.check(value, ctx),
        None => adapter.validate_field(value, ctx),
    })
}

/// Runs a synchronous validator step, turning a panic into a failure.
pub(super) fn guarded<T>(f: impl FnOnce() -> Outcome<T>) -> Outcome<T> {
    catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Outcome::Ready(Err(ValidatorFailure::from_panic(payload))))
}

/// Wraps an already-issued ticket and its outcome into a run. A ready
/// outcome is applied before this returns.
pub(super) fn run(
    cell: Arc<FieldCell>,
    form: Weak<FormInner>,
    ticket: ValidationTicket,
    label: String,
    outcome: Outcome<Verdict>,
) -> FormResult<ValidationRun> {
    let path = cell.path.clone();
    let weak = Arc::downgrade(&cell);
    match outcome {
        Outcome::Ready(result) => {
            let validation = finish(&cell, &form, ticket, &label, result)?;
            Ok(ValidationRun {
                path,
                ticket,
                settled: true,
                cell: weak,
                inner: ready(Ok(validation)).boxed(),
            })
        }
        deferred @ Outcome::Deferred(_) => {
            let inner = async move {
                let result = deferred.resolve().await;
                finish(&cell, &form, ticket, &label, result)
            };
            Ok(ValidationRun {
                path,
                ticket,
                settled: false,
                cell: weak,
                inner: inner.boxed(),
            })
        }
    }
}

fn is_latest(cell: &FieldCell, ticket: ValidationTicket) -> FormResult<bool> {
    Ok(read_lock(&cell.state, "checking latest validation ticket")?.ticket == ticket)
}

fn superseded(cell: &FieldCell, ticket: ValidationTicket) -> FormResult<FieldValidation> {
    let state = read_lock(&cell.state, "observing superseded field")?;
    Ok(FieldValidation {
        path: cell.path.clone(),
        ticket,
        errors: state.errors.clone(),
        valid: state.meta.valid,
        applied: false,
    })
}

enum Report {
    Failed(ValidatorFailure),
    Misconfigured(String),
}

/// Applies a completed run if its ticket is still the latest; otherwise the
/// result is dropped without touching the field.
fn finish(
    cell: &FieldCell,
    form: &Weak<FormInner>,
    ticket: ValidationTicket,
    label: &str,
    result: Result<Verdict, ValidatorFailure>,
) -> FormResult<FieldValidation> {
    let form = form.upgrade();
    let mut report = None;
    let validation = {
        let mut state = write_lock(&cell.state, "applying validation result")?;
        if state.ticket != ticket {
            trace!(
                path = %cell.path,
                ticket = ticket.0,
                latest = state.ticket.0,
                "stale validation result discarded"
            );
            drop(state);
            return superseded(cell, ticket);
        }

        match result {
            Ok(verdict) => match verdict.into_messages(label) {
                Ok(messages) => state.errors = messages,
                Err(detail) => report = Some(Report::Misconfigured(detail)),
            },
            Err(failure) => {
                let message = form
                    .as_ref()
                    .map(|form| form.options.failure_message.clone())
                    .unwrap_or_else(|| DEFAULT_FAILURE_MESSAGE.to_string());
                state.errors = vec![message];
                report = Some(Report::Failed(failure));
            }
        }
        state.meta.valid = state.errors.is_empty();
        state.meta.pending = false;
        FieldValidation {
            path: cell.path.clone(),
            ticket,
            errors: state.errors.clone(),
            valid: state.meta.valid,
            applied: true,
        }
    };
    trace!(path = %cell.path, ticket = ticket.0, "validation applied");

    match (form.as_deref(), report) {
        (Some(form), Some(Report::Failed(failure))) => {
            form.options.diagnostics.validator_failed(&cell.path, &failure);
        }
        (Some(form), Some(Report::Misconfigured(detail))) => {
            form.report_misconfigured(&cell.path, &detail)?;
        }
        (None, Some(Report::Failed(failure))) => {
            TracingDiagnostics.validator_failed(&cell.path, &failure);
        }
        (None, Some(Report::Misconfigured(detail))) => {
            TracingDiagnostics.misconfigured(Some(&cell.path), &detail);
        }
        (_, None) => {}
    }
    if let Some(form) = form {
        form.recompute_meta()?;
    }
    Ok(validation)
}
