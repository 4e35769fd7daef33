use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures::task::{Spawn, SpawnExt};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use super::diagnostics::{Diagnostics, TracingDiagnostics};
use super::executor::ValidationRun;
use super::field::{FieldCell, FieldHandle, FieldOptions};
use super::schema::{Schema, SchemaAdapter};
use super::validation::InvalidSubmit;
use crate::path::{FieldPath, IntoFieldPath};

static FORM_ID_ALLOCATOR: AtomicU64 = AtomicU64::new(1);

pub(super) const DEFAULT_FAILURE_MESSAGE: &str = "Validation failed";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FormId(pub u64);

impl FormId {
    pub fn next() -> Self {
        Self(FORM_ID_ALLOCATOR.fetch_add(1, Ordering::SeqCst))
    }
}

/// Per-field validation run number. Only the latest issued ticket may apply
/// its result.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ValidationTicket(pub u64);

impl ValidationTicket {
    pub(super) fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubmitState {
    Idle,
    Validating,
    Submitting,
    Succeeded,
    Failed,
}

pub type InvalidSubmitHandler = Arc<dyn Fn(&InvalidSubmit) + Send + Sync>;
pub type ValidationSpawner = Arc<dyn Spawn + Send + Sync>;

#[derive(Clone)]
pub struct FormOptions {
    /// Default trigger policy for fields that do not override it.
    pub validate_on_value_update: bool,
    /// Initial values looked up by path for fields registered without one.
    pub initial_values: Value,
    /// Message recorded on a field whose validator failed or panicked.
    pub failure_message: String,
    pub diagnostics: Arc<dyn Diagnostics>,
    pub on_invalid_submit: Option<InvalidSubmitHandler>,
    /// Runs deferred validations started from synchronous entry points.
    /// Without one they queue until [`FormController::settle`] is awaited.
    pub spawner: Option<ValidationSpawner>,
}

impl Default for FormOptions {
    fn default() -> Self {
        Self {
            validate_on_value_update: true,
            initial_values: Value::Object(Map::new()),
            failure_message: DEFAULT_FAILURE_MESSAGE.to_string(),
            diagnostics: Arc::new(TracingDiagnostics),
            on_invalid_submit: None,
            spawner: None,
        }
    }
}

impl Debug for FormOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormOptions")
            .field("validate_on_value_update", &self.validate_on_value_update)
            .field("initial_values", &self.initial_values)
            .field("failure_message", &self.failure_message)
            .field("on_invalid_submit", &self.on_invalid_submit.is_some())
            .field("spawner", &self.spawner.is_some())
            .finish_non_exhaustive()
    }
}

/// Aggregate over every registered field.
#[derive(Clone, Debug, PartialEq)]
pub struct FormMeta {
    pub dirty: bool,
    pub touched: bool,
    pub pending: bool,
    /// Vacuously true while no field is registered.
    pub valid: bool,
    pub initial_values: Value,
    pub submit_count: u32,
    pub submit_state: SubmitState,
}

impl Default for FormMeta {
    fn default() -> Self {
        Self {
            dirty: false,
            touched: false,
            pending: false,
            valid: true,
            initial_values: Value::Object(Map::new()),
            submit_count: 0,
            submit_state: SubmitState::Idle,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum FormError {
    #[error("form state lock poisoned while {0}")]
    StatePoisoned(&'static str),
    #[error("invalid field path `{path}`: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    #[error("no field registered at `{0}`")]
    UnknownField(FieldPath),
    #[error("the form behind this handle has been dropped")]
    Detached,
    #[error("invalid submit state transition: {from:?} -> {to:?}")]
    InvalidStateTransition { from: SubmitState, to: SubmitState },
    #[error("form submit is already in progress")]
    AlreadySubmitting,
    #[error("failed to convert form values: {0}")]
    Serialization(String),
}

pub type FormResult<T> = Result<T, FormError>;

#[derive(Default)]
pub(super) struct Registry {
    order: Vec<FieldPath>,
    fields: BTreeMap<FieldPath, Arc<FieldCell>>,
}

impl Registry {
    pub(super) fn get(&self, path: &FieldPath) -> Option<&Arc<FieldCell>> {
        self.fields.get(path)
    }

    fn insert(&mut self, cell: Arc<FieldCell>) {
        self.order.push(cell.path.clone());
        self.fields.insert(cell.path.clone(), cell);
    }

    fn remove(&mut self, path: &FieldPath) -> Option<Arc<FieldCell>> {
        let removed = self.fields.remove(path)?;
        self.order.retain(|entry| entry != path);
        Some(removed)
    }

    pub(super) fn cells(&self) -> Vec<Arc<FieldCell>> {
        self.order
            .iter()
            .filter_map(|path| self.fields.get(path).cloned())
            .collect()
    }
}

pub(super) struct FormInner {
    pub(super) id: FormId,
    pub(super) options: FormOptions,
    pub(super) registry: RwLock<Registry>,
    pub(super) schema: RwLock<Arc<SchemaAdapter>>,
    pub(super) meta: RwLock<FormMeta>,
    pub(super) background: Mutex<Vec<ValidationRun>>,
    pub(super) reported: Mutex<Vec<FieldPath>>,
}

impl FormInner {
    pub(super) fn cells(&self) -> FormResult<Vec<Arc<FieldCell>>> {
        Ok(read_lock(&self.registry, "listing registered fields")?.cells())
    }

    pub(super) fn adapter(&self) -> FormResult<Arc<SchemaAdapter>> {
        Ok(read_lock(&self.schema, "reading validation schema")?.clone())
    }

    pub(super) fn values_of(cells: &[Arc<FieldCell>]) -> FormResult<Value> {
        let mut values = Value::Object(Map::new());
        for cell in cells {
            let value = read_lock(&cell.state, "reading field value for snapshot")?
                .value
                .clone();
            cell.path.set(&mut values, value);
        }
        Ok(values)
    }

    pub(super) fn recompute_meta(&self) -> FormResult<()> {
        let cells = self.cells()?;
        let mut dirty = false;
        let mut touched = false;
        let mut pending = false;
        let mut valid = true;
        let mut initial_values = Value::Object(Map::new());
        for cell in &cells {
            let state = read_lock(&cell.state, "folding field meta")?;
            dirty |= state.meta.dirty;
            touched |= state.meta.touched;
            pending |= state.meta.pending;
            valid &= state.meta.valid;
            cell.path.set(
                &mut initial_values,
                state.initial_value.clone().unwrap_or(Value::Null),
            );
        }

        let mut meta = write_lock(&self.meta, "writing aggregate form meta")?;
        meta.dirty = dirty;
        meta.touched = touched;
        meta.pending = pending;
        meta.valid = valid;
        meta.initial_values = initial_values;
        Ok(())
    }

    pub(super) fn dispatch(&self, run: ValidationRun) -> FormResult<()> {
        if run.is_settled() {
            return Ok(());
        }
        if let Some(spawner) = self
            .options
            .spawner
            .as_ref()
            .filter(|spawner| spawner.status().is_ok())
        {
            let path = run.path().clone();
            let task_path = path.clone();
            let task = async move {
                if let Err(error) = run.await {
                    warn!(path = %task_path, %error, "background validation failed");
                }
            };
            if let Err(error) = spawner.spawn(task) {
                warn!(path = %path, %error, "validation spawner rejected run");
            }
            return Ok(());
        }
        let mut queued = lock(&self.background, "queueing background validation")?;
        queued.retain(|waiting| waiting.path() != run.path() && waiting.is_current());
        queued.push(run);
        Ok(())
    }

    /// Drops queued runs whose result would be discarded anyway.
    pub(super) fn prune_background(&self) -> FormResult<()> {
        lock(&self.background, "pruning background validation")?
            .retain(ValidationRun::is_current);
        Ok(())
    }

    /// Reports a misconfigured validator once per path until the schema changes.
    pub(super) fn report_misconfigured(&self, path: &FieldPath, detail: &str) -> FormResult<()> {
        {
            let mut reported = lock(&self.reported, "recording misconfigured field")?;
            if reported.contains(path) {
                return Ok(());
            }
            reported.push(path.clone());
        }
        self.options.diagnostics.misconfigured(Some(path), detail);
        Ok(())
    }
}

#[derive(Clone)]
pub struct FormController {
    pub(super) inner: Arc<FormInner>,
}

impl Debug for FormController {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormController")
            .field("id", &self.inner.id)
            .finish_non_exhaustive()
    }
}

impl Default for FormController {
    fn default() -> Self {
        Self::new(FormOptions::default())
    }
}

impl FormController {
    pub fn new(options: FormOptions) -> Self {
        Self::with_schema(Schema::None, options)
    }

    pub fn with_schema(schema: Schema, options: FormOptions) -> Self {
        let adapter = SchemaAdapter::resolve(schema, options.diagnostics.as_ref());
        Self {
            inner: Arc::new(FormInner {
                id: FormId::next(),
                options,
                registry: RwLock::new(Registry::default()),
                schema: RwLock::new(Arc::new(adapter)),
                meta: RwLock::new(FormMeta::default()),
                background: Mutex::new(Vec::new()),
                reported: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn form_id(&self) -> FormId {
        self.inner.id
    }

    pub fn options(&self) -> &FormOptions {
        &self.inner.options
    }

    pub fn register(
        &self,
        path: impl IntoFieldPath,
        initial_value: Option<Value>,
    ) -> FormResult<FieldHandle> {
        let options = FieldOptions {
            initial_value,
            ..FieldOptions::default()
        };
        self.register_with(path, options)
    }

    /// Registers a field, or returns the field already registered at `path`.
    /// The first registration's options and initial value win.
    pub fn register_with(
        &self,
        path: impl IntoFieldPath,
        options: FieldOptions,
    ) -> FormResult<FieldHandle> {
        let path = path.into_field_path()?;
        let (cell, created) = {
            let mut registry = write_lock(&self.inner.registry, "registering field")?;
            match registry.get(&path) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let initial_value = options
                        .initial_value
                        .clone()
                        .or_else(|| path.get(&self.inner.options.initial_values).cloned());
                    let cell = Arc::new(FieldCell::new(path.clone(), initial_value, options));
                    registry.insert(cell.clone());
                    (cell, true)
                }
            }
        };

        if created {
            debug!(form = self.inner.id.0, path = %path, "field registered");
            self.inner.recompute_meta()?;
        }
        Ok(self.handle(cell))
    }

    pub fn unregister(&self, path: impl IntoFieldPath) -> FormResult<bool> {
        let path = path.into_field_path()?;
        let removed = write_lock(&self.inner.registry, "unregistering field")?.remove(&path);
        let Some(cell) = removed else {
            return Ok(false);
        };
        {
            let mut state = write_lock(&cell.state, "detaching unregistered field")?;
            state.ticket = state.ticket.next();
            state.meta.pending = false;
        }
        debug!(form = self.inner.id.0, path = %path, "field unregistered");
        self.inner.prune_background()?;
        self.inner.recompute_meta()?;
        Ok(true)
    }

    pub fn field(&self, path: impl IntoFieldPath) -> FormResult<Option<FieldHandle>> {
        let path = path.into_field_path()?;
        let cell = read_lock(&self.inner.registry, "looking up field")?
            .get(&path)
            .cloned();
        Ok(cell.map(|cell| self.handle(cell)))
    }

    pub(super) fn require_field(&self, path: impl IntoFieldPath) -> FormResult<FieldHandle> {
        let path = path.into_field_path()?;
        self.field(&path)?.ok_or(FormError::UnknownField(path))
    }

    /// Registered paths in registration order.
    pub fn paths(&self) -> FormResult<Vec<FieldPath>> {
        Ok(self
            .inner
            .cells()?
            .iter()
            .map(|cell| cell.path.clone())
            .collect())
    }

    /// Runs waiting for [`Self::settle`]. Always zero with a spawner.
    pub fn queued_runs(&self) -> FormResult<usize> {
        Ok(lock(&self.inner.background, "counting background validation")?.len())
    }

    pub fn len(&self) -> FormResult<usize> {
        Ok(read_lock(&self.inner.registry, "counting fields")?.order.len())
    }

    pub fn is_empty(&self) -> FormResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Current values of every registered field, nested by path.
    pub fn values(&self) -> FormResult<Value> {
        FormInner::values_of(&self.inner.cells()?)
    }

    pub fn meta(&self) -> FormResult<FormMeta> {
        Ok(read_lock(&self.inner.meta, "reading form meta")?.clone())
    }

    pub fn errors(&self) -> FormResult<BTreeMap<FieldPath, Vec<String>>> {
        let mut errors = BTreeMap::new();
        for cell in self.inner.cells()? {
            let state = read_lock(&cell.state, "collecting field errors")?;
            if !state.errors.is_empty() {
                errors.insert(cell.path.clone(), state.errors.clone());
            }
        }
        Ok(errors)
    }

    pub fn set_field_value(&self, path: impl IntoFieldPath, value: Value) -> FormResult<()> {
        self.require_field(path)?.set_value(value)
    }

    pub fn set_field_touched(&self, path: impl IntoFieldPath, touched: bool) -> FormResult<()> {
        self.require_field(path)?.set_touched(touched)
    }

    pub fn set_field_error(
        &self,
        path: impl IntoFieldPath,
        messages: Vec<String>,
    ) -> FormResult<()> {
        self.require_field(path)?.set_errors(messages)
    }

    pub fn set_errors<P, I>(&self, errors: I) -> FormResult<()>
    where
        P: IntoFieldPath,
        I: IntoIterator<Item = (P, Vec<String>)>,
    {
        for (path, messages) in errors {
            self.set_field_error(path, messages)?;
        }
        Ok(())
    }

    /// Resets every field, optionally replacing initial values from `values`
    /// by path, and clears submit bookkeeping.
    pub fn reset_form(&self, values: Option<Value>) -> FormResult<()> {
        for cell in self.inner.cells()? {
            let initial = values
                .as_ref()
                .map(|values| cell.path.get(values).cloned().unwrap_or(Value::Null));
            self.handle(cell).reset_with(initial)?;
        }
        {
            let mut meta = write_lock(&self.inner.meta, "resetting submit state")?;
            transition_submit_state(&mut meta, SubmitState::Idle)?;
            meta.submit_count = 0;
        }
        debug!(form = self.inner.id.0, "form reset");
        self.inner.recompute_meta()
    }

    pub(super) fn handle(&self, cell: Arc<FieldCell>) -> FieldHandle {
        FieldHandle {
            cell,
            form: Arc::downgrade(&self.inner),
        }
    }
}

pub(super) fn transition_submit_state(meta: &mut FormMeta, next: SubmitState) -> FormResult<()> {
    let current = meta.submit_state;
    if current == next {
        return Ok(());
    }

    let allowed = matches!(
        (current, next),
        (SubmitState::Idle, SubmitState::Validating)
            | (SubmitState::Validating, SubmitState::Submitting)
            | (SubmitState::Validating, SubmitState::Failed)
            | (SubmitState::Submitting, SubmitState::Succeeded)
            | (SubmitState::Submitting, SubmitState::Failed)
            | (SubmitState::Succeeded, SubmitState::Validating)
            | (SubmitState::Failed, SubmitState::Validating)
            | (_, SubmitState::Idle)
    );
    if !allowed {
        return Err(FormError::InvalidStateTransition {
            from: current,
            to: next,
        });
    }
    meta.submit_state = next;
    Ok(())
}

pub(super) fn read_lock<'a, T>(
    lock: &'a RwLock<T>,
    context: &'static str,
) -> FormResult<RwLockReadGuard<'a, T>> {
    lock.read().map_err(|_| FormError::StatePoisoned(context))
}

pub(super) fn write_lock<'a, T>(
    lock: &'a RwLock<T>,
    context: &'static str,
) -> FormResult<RwLockWriteGuard<'a, T>> {
    lock.write().map_err(|_| FormError::StatePoisoned(context))
}

pub(super) fn lock<'a, T>(
    mutex: &'a Mutex<T>,
    context: &'static str,
) -> FormResult<MutexGuard<'a, T>> {
    mutex.lock().map_err(|_| FormError::StatePoisoned(context))
}
