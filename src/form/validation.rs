use std::collections::BTreeMap;
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;

use futures::future::{BoxFuture, Shared, join_all};
use futures::{FutureExt, Stream, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use super::controller::{
    FormController, FormError, FormInner, FormResult, SubmitState, lock, read_lock,
    transition_submit_state, write_lock,
};
use super::executor::{self, ValidationRun};
use super::field::{FieldCell, FieldHandle};
use super::schema::{Outcome, Schema, SchemaAdapter, ValidatorFailure, Verdict};
use crate::path::{FieldPath, IntoFieldPath};

/// A serializable struct whose fields map one-to-one onto form fields.
///
/// Usually derived with `#[derive(FormModel)]`, which also generates a
/// `{Model}Fields` accessor struct returning each field's [`FieldPath`].
pub trait FormModel {
    type Fields;

    fn fields() -> Self::Fields;

    /// Top-level value keys, in declaration order.
    fn field_paths() -> &'static [&'static str];
}

pub type FieldErrors = BTreeMap<FieldPath, Vec<String>>;

#[derive(Clone, Debug, PartialEq)]
pub struct FormValidation {
    pub valid: bool,
    /// Fields with at least one message.
    pub errors: FieldErrors,
}

/// Handed to the invalid-submit callback.
#[derive(Clone, Debug, PartialEq)]
pub struct InvalidSubmit {
    pub values: Value,
    pub errors: FieldErrors,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SubmitOutcome<R> {
    Submitted(R),
    Invalid(FieldErrors),
}

impl<R> SubmitOutcome<R> {
    pub fn is_submitted(&self) -> bool {
        matches!(self, Self::Submitted(_))
    }
}

type WholeResult = Result<FieldErrors, ValidatorFailure>;

/// One whole-schema evaluation shared by every field run of a form pass.
enum WholeSchema {
    Ready(WholeResult),
    Shared(Shared<BoxFuture<'static, WholeResult>>),
}

impl WholeSchema {
    fn new(outcome: Outcome<FieldErrors>) -> Self {
        match outcome {
            Outcome::Ready(result) => Self::Ready(result),
            deferred @ Outcome::Deferred(_) => Self::Shared(deferred.resolve().boxed().shared()),
        }
    }

    fn for_path(&self, path: &FieldPath) -> Outcome<Verdict> {
        match self {
            Self::Ready(result) => {
                Outcome::Ready(result.clone().map(|errors| verdict_at(&errors, path)))
            }
            Self::Shared(shared) => {
                let path = path.clone();
                Outcome::from_future(
                    shared
                        .clone()
                        .map(move |result| result.map(|errors| verdict_at(&errors, &path))),
                )
            }
        }
    }
}

fn verdict_at(errors: &FieldErrors, path: &FieldPath) -> Verdict {
    Verdict::from(errors.get(path).cloned().unwrap_or_default())
}

impl FormController {
    /// Validates every registered field. Tickets for all fields are issued
    /// before any run is awaited; the runs are then driven concurrently.
    pub async fn validate(&self) -> FormResult<FormValidation> {
        let cells = self.inner.cells()?;
        let mut tickets = Vec::with_capacity(cells.len());
        for cell in &cells {
            tickets.push(executor::begin(cell)?);
        }
        self.inner.prune_background()?;
        self.inner.recompute_meta()?;

        let adapter = self.inner.adapter()?;
        let values = FormInner::values_of(&cells)?;
        let whole = self.whole_schema(&adapter, &cells, &values);

        let mut runs = Vec::with_capacity(cells.len());
        for (cell, ticket) in cells.into_iter().zip(tickets) {
            let (label, outcome) = match (&whole, &cell.options.rule) {
                (Some(whole), None) => (
                    executor::label_for(&cell, &adapter),
                    whole.for_path(&cell.path),
                ),
                _ => executor::prepare_with(&cell, &adapter, values.clone())?,
            };
            let form = Arc::downgrade(&self.inner);
            runs.push(executor::run(cell, form, ticket, label, outcome)?);
        }

        for result in join_all(runs).await {
            result?;
        }
        let errors = self.errors()?;
        let valid = errors.is_empty();
        debug!(form = self.inner.id.0, valid, "form validated");
        Ok(FormValidation { valid, errors })
    }

    fn whole_schema(
        &self,
        adapter: &SchemaAdapter,
        cells: &[Arc<FieldCell>],
        values: &Value,
    ) -> Option<WholeSchema> {
        if !adapter.is_structured() || cells.iter().all(|cell| cell.options.rule.is_some()) {
            return None;
        }
        let paths = cells.iter().map(|cell| cell.path.clone()).collect::<Vec<_>>();
        Some(WholeSchema::new(executor::guarded(|| {
            adapter.validate_all(values, &paths)
        })))
    }

    pub fn validate_field(&self, path: impl IntoFieldPath) -> FormResult<ValidationRun> {
        self.require_field(path)?.validate()
    }

    /// Replaces the schema and re-runs validation for fields that have been
    /// validated before. Untouched fields stay quiet.
    pub fn set_validation_schema(&self, schema: Schema) -> FormResult<()> {
        let adapter = SchemaAdapter::resolve(schema, self.inner.options.diagnostics.as_ref());
        *write_lock(&self.inner.schema, "replacing validation schema")? = Arc::new(adapter);
        lock(&self.inner.reported, "clearing misconfiguration reports")?.clear();
        debug!(form = self.inner.id.0, "validation schema replaced");

        for cell in self.inner.cells()? {
            if !read_lock(&cell.state, "checking validation history")?.meta.validated {
                continue;
            }
            let run = self.handle(cell).validate()?;
            self.inner.dispatch(run)?;
        }
        Ok(())
    }

    /// Applies every schema `schemas` yields until the stream ends.
    pub async fn follow_schema<S>(&self, schemas: S) -> FormResult<()>
    where
        S: Stream<Item = Schema>,
    {
        let mut schemas = pin!(schemas);
        while let Some(schema) = schemas.next().await {
            self.set_validation_schema(schema)?;
        }
        Ok(())
    }

    /// Drives queued background runs until none are left. Only needed when
    /// no spawner is configured.
    pub async fn settle(&self) -> FormResult<()> {
        loop {
            let runs = {
                let mut queued = lock(&self.inner.background, "draining background runs")?;
                std::mem::take(&mut *queued)
            };
            if runs.is_empty() {
                return Ok(());
            }
            for result in join_all(runs).await {
                result?;
            }
        }
    }

    /// Validates, then calls `on_valid` with the values snapshot, or
    /// [`super::FormOptions::on_invalid_submit`] when validation fails.
    pub async fn handle_submit<F, Fut, R>(&self, on_valid: F) -> FormResult<SubmitOutcome<R>>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = FormResult<R>>,
    {
        let fallback = self.inner.options.on_invalid_submit.clone();
        self.handle_submit_with(on_valid, move |invalid: &InvalidSubmit| {
            if let Some(handler) = fallback {
                handler(invalid);
            }
        })
        .await
    }

    pub async fn handle_submit_with<F, Fut, R, I>(
        &self,
        on_valid: F,
        on_invalid: I,
    ) -> FormResult<SubmitOutcome<R>>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = FormResult<R>>,
        I: FnOnce(&InvalidSubmit),
    {
        {
            let mut meta = write_lock(&self.inner.meta, "preparing submit")?;
            if matches!(
                meta.submit_state,
                SubmitState::Validating | SubmitState::Submitting
            ) {
                return Err(FormError::AlreadySubmitting);
            }
            transition_submit_state(&mut meta, SubmitState::Validating)?;
            meta.submit_count = meta.submit_count.saturating_add(1);
        }

        let validation = match self.validate().await {
            Ok(validation) => validation,
            Err(error) => {
                self.set_submit_state(SubmitState::Failed)?;
                return Err(error);
            }
        };

        if !validation.valid {
            self.set_submit_state(SubmitState::Failed)?;
            let invalid = InvalidSubmit {
                values: self.values()?,
                errors: validation.errors,
            };
            debug!(
                form = self.inner.id.0,
                fields = invalid.errors.len(),
                "submit blocked by validation errors"
            );
            on_invalid(&invalid);
            return Ok(SubmitOutcome::Invalid(invalid.errors));
        }

        self.set_submit_state(SubmitState::Submitting)?;
        let values = self.values()?;
        let result = on_valid(values).await;
        if result.is_ok() {
            self.set_submit_state(SubmitState::Succeeded)?;
        } else {
            self.set_submit_state(SubmitState::Failed)?;
        }
        debug!(form = self.inner.id.0, ok = result.is_ok(), "submit finished");
        result.map(SubmitOutcome::Submitted)
    }

    /// Like [`Self::handle_submit`], with the values deserialized into `T`.
    pub async fn handle_submit_as<T, F, Fut, R>(&self, on_valid: F) -> FormResult<SubmitOutcome<R>>
    where
        T: DeserializeOwned,
        F: FnOnce(T) -> Fut,
        Fut: Future<Output = FormResult<R>>,
    {
        self.handle_submit(|values| async move {
            let model = serde_json::from_value::<T>(values)
                .map_err(|error| FormError::Serialization(error.to_string()))?;
            on_valid(model).await
        })
        .await
    }

    /// Registers every field of `model`, using its current values as initial
    /// values.
    pub fn register_model<M>(&self, model: &M) -> FormResult<Vec<FieldHandle>>
    where
        M: FormModel + Serialize,
    {
        let values = serde_json::to_value(model)
            .map_err(|error| FormError::Serialization(error.to_string()))?;
        M::field_paths()
            .iter()
            .map(|name| {
                let path = FieldPath::key(*name);
                let initial_value = path.get(&values).cloned();
                self.register(path, initial_value)
            })
            .collect()
    }

    fn set_submit_state(&self, next: SubmitState) -> FormResult<()> {
        let mut meta = write_lock(&self.inner.meta, "updating submit state")?;
        transition_submit_state(&mut meta, next)
    }
}
