use std::fmt::{Debug, Formatter};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use serde_json::Value;
use tracing::trace;

use super::binding::{ModelListener, ModelSync};
use super::controller::{FormInner, FormResult, ValidationTicket, read_lock, write_lock};
use super::executor::{self, Trigger, ValidationRun};
use super::schema::FieldRule;
use crate::path::FieldPath;

/// Observable state flags of one field.
///
/// `valid` starts out `true` and only becomes meaningful once a run has
/// completed; combine it with `dirty`/`touched` (or `validated`) before
/// treating it as "passed validation".
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FieldMeta {
    pub dirty: bool,
    pub touched: bool,
    pub pending: bool,
    pub valid: bool,
    /// A run was issued since registration or the last reset.
    pub validated: bool,
}

impl Default for FieldMeta {
    fn default() -> Self {
        Self {
            dirty: false,
            touched: false,
            pending: false,
            valid: true,
            validated: false,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct FieldOptions {
    pub initial_value: Option<Value>,
    pub label: Option<String>,
    /// Field-level rule; takes precedence over the form schema.
    pub rule: Option<FieldRule>,
    /// Overrides [`super::FormOptions::validate_on_value_update`].
    pub validate_on_value_update: Option<bool>,
    /// Delay applied to value-update runs only.
    pub debounce: Duration,
    pub model_sync: ModelSync,
}

impl FieldOptions {
    pub fn initial_value(mut self, value: Value) -> Self {
        self.initial_value = Some(value);
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn rule(mut self, rule: FieldRule) -> Self {
        self.rule = Some(rule);
        self
    }

    pub fn validate_on_value_update(mut self, enabled: bool) -> Self {
        self.validate_on_value_update = Some(enabled);
        self
    }

    pub fn debounce_ms(mut self, debounce_ms: u64) -> Self {
        self.debounce = Duration::from_millis(debounce_ms);
        self
    }

    pub fn model_sync(mut self, model_sync: ModelSync) -> Self {
        self.model_sync = model_sync;
        self
    }
}

pub(super) struct FieldState {
    pub(super) value: Value,
    pub(super) initial_value: Option<Value>,
    pub(super) errors: Vec<String>,
    pub(super) meta: FieldMeta,
    pub(super) ticket: ValidationTicket,
}

impl FieldState {
    fn baseline(&self) -> Value {
        self.initial_value.clone().unwrap_or(Value::Null)
    }
}

pub(super) struct FieldCell {
    pub(super) path: FieldPath,
    pub(super) options: FieldOptions,
    pub(super) state: RwLock<FieldState>,
    pub(super) listeners: RwLock<Vec<ModelListener>>,
}

impl FieldCell {
    pub(super) fn new(
        path: FieldPath,
        initial_value: Option<Value>,
        options: FieldOptions,
    ) -> Self {
        Self {
            path,
            options,
            state: RwLock::new(FieldState {
                value: initial_value.clone().unwrap_or(Value::Null),
                initial_value,
                errors: Vec::new(),
                meta: FieldMeta::default(),
                ticket: ValidationTicket::default(),
            }),
            listeners: RwLock::new(Vec::new()),
        }
    }
}

/// Handle to a registered field. Cheap to clone; all clones share one field.
#[derive(Clone)]
pub struct FieldHandle {
    pub(super) cell: Arc<FieldCell>,
    pub(super) form: Weak<FormInner>,
}

impl Debug for FieldHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldHandle")
            .field("path", &self.cell.path)
            .finish_non_exhaustive()
    }
}

impl FieldHandle {
    pub fn path(&self) -> &FieldPath {
        &self.cell.path
    }

    pub fn label(&self) -> Option<&str> {
        self.cell.options.label.as_deref()
    }

    pub fn value(&self) -> FormResult<Value> {
        Ok(read_lock(&self.cell.state, "reading field value")?.value.clone())
    }

    pub fn initial_value(&self) -> FormResult<Option<Value>> {
        Ok(read_lock(&self.cell.state, "reading initial value")?
            .initial_value
            .clone())
    }

    pub fn errors(&self) -> FormResult<Vec<String>> {
        Ok(read_lock(&self.cell.state, "reading field errors")?.errors.clone())
    }

    pub fn error_message(&self) -> FormResult<Option<String>> {
        Ok(read_lock(&self.cell.state, "reading field error message")?
            .errors
            .first()
            .cloned())
    }

    pub fn meta(&self) -> FormResult<FieldMeta> {
        Ok(read_lock(&self.cell.state, "reading field meta")?.meta)
    }

    /// Whether this handle's field is still the one registered at its path.
    pub fn is_registered(&self) -> bool {
        let Some(form) = self.form.upgrade() else {
            return false;
        };
        read_lock(&form.registry, "checking field registration").is_ok_and(|registry| {
            registry
                .get(&self.cell.path)
                .is_some_and(|cell| Arc::ptr_eq(cell, &self.cell))
        })
    }

    pub fn set_value(&self, value: Value) -> FormResult<()> {
        self.set_value_with(value, true)
    }

    pub fn set_value_with(&self, value: Value, should_validate: bool) -> FormResult<()> {
        if let Some(run) = self.write_value(value, should_validate, true)? {
            self.dispatch(run)?;
        }
        Ok(())
    }

    /// Like [`Self::set_value`], but waits for the run it starts.
    pub async fn set_value_async(&self, value: Value) -> FormResult<()> {
        if let Some(run) = self.write_value(value, true, true)? {
            run.await?;
        }
        Ok(())
    }

    /// Marks the field touched. Never validates.
    pub fn set_touched(&self, touched: bool) -> FormResult<()> {
        write_lock(&self.cell.state, "touching field")?.meta.touched = touched;
        self.notify_form()
    }

    /// Starts a run regardless of the trigger policy.
    pub fn validate(&self) -> FormResult<ValidationRun> {
        executor::start(self, Trigger::Explicit)
    }

    pub fn reset(&self) -> FormResult<()> {
        self.reset_with(None)
    }

    pub fn reset_to(&self, initial_value: Value) -> FormResult<()> {
        self.reset_with(Some(initial_value))
    }

    pub fn set_errors(&self, messages: Vec<String>) -> FormResult<()> {
        {
            let mut state = write_lock(&self.cell.state, "writing field errors")?;
            state.meta.valid = messages.is_empty();
            state.errors = messages;
        }
        self.notify_form()
    }

    pub(super) fn write_value(
        &self,
        value: Value,
        should_validate: bool,
        emit: bool,
    ) -> FormResult<Option<ValidationRun>> {
        let validate = should_validate && self.validates_on_value_update();
        self.store_value(value, validate, emit)
    }

    /// Writes under the form's trigger policy, ignoring this field's override.
    pub(super) fn write_value_by_form_policy(
        &self,
        value: Value,
    ) -> FormResult<Option<ValidationRun>> {
        let validate = self
            .form
            .upgrade()
            .is_none_or(|form| form.options.validate_on_value_update);
        self.store_value(value, validate, true)
    }

    fn store_value(
        &self,
        value: Value,
        validate: bool,
        emit: bool,
    ) -> FormResult<Option<ValidationRun>> {
        let changed = {
            let mut state = write_lock(&self.cell.state, "writing field value")?;
            let changed = state.value != value;
            state.value = value.clone();
            let differs = state.value != state.baseline();
            state.meta.dirty |= differs;
            changed
        };

        if changed && emit {
            self.emit_model_update(&value)?;
        }
        self.notify_form()?;

        if validate {
            return executor::start(self, Trigger::ValueUpdate).map(Some);
        }
        Ok(None)
    }

    /// Restores the (new) initial value and clears errors and flags. The
    /// ticket is bumped without starting a run, so in-flight runs land stale.
    pub(super) fn reset_with(&self, initial_value: Option<Value>) -> FormResult<()> {
        let (value, changed) = {
            let mut state = write_lock(&self.cell.state, "resetting field")?;
            if let Some(initial_value) = initial_value {
                state.initial_value = Some(initial_value);
            }
            let value = state.baseline();
            let changed = state.value != value;
            state.value = value.clone();
            state.errors.clear();
            state.meta = FieldMeta::default();
            state.ticket = state.ticket.next();
            (value, changed)
        };
        trace!(path = %self.cell.path, "field reset");

        if changed {
            self.emit_model_update(&value)?;
        }
        self.notify_form()
    }

    pub(super) fn notify_form(&self) -> FormResult<()> {
        match self.form.upgrade() {
            Some(form) => form.recompute_meta(),
            None => Ok(()),
        }
    }

    pub(super) fn dispatch(&self, run: ValidationRun) -> FormResult<()> {
        match self.form.upgrade() {
            Some(form) => form.dispatch(run),
            None => Ok(()),
        }
    }

    fn validates_on_value_update(&self) -> bool {
        self.cell.options.validate_on_value_update.unwrap_or_else(|| {
            self.form
                .upgrade()
                .is_none_or(|form| form.options.validate_on_value_update)
        })
    }
}
