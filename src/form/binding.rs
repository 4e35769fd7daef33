use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Weak};

use serde_json::Value;
use tracing::trace;

use super::controller::{FormController, FormError, FormInner, FormResult, read_lock, write_lock};
use super::field::FieldHandle;
use crate::path::{FieldPath, IntoFieldPath};

pub const DEFAULT_MODEL_PROP: &str = "modelValue";
pub const DEFAULT_MODEL_EVENT: &str = "update:modelValue";

/// Two-way value binding between a field and an external component.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ModelSync {
    pub enabled: bool,
    /// Name of the prop whose pushes are accepted as value updates.
    pub prop: String,
    /// Name of the event emitted on every value change.
    pub event: String,
}

impl Default for ModelSync {
    fn default() -> Self {
        Self {
            enabled: true,
            prop: DEFAULT_MODEL_PROP.to_string(),
            event: DEFAULT_MODEL_EVENT.to_string(),
        }
    }
}

impl ModelSync {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn named(prop: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            enabled: true,
            prop: prop.into(),
            event: event.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelUpdate {
    pub event: String,
    pub path: FieldPath,
    pub value: Value,
}

pub(super) type ModelListener = Arc<dyn Fn(&ModelUpdate) + Send + Sync>;

impl FieldHandle {
    /// Subscribes to value changes. Only called while model sync is enabled.
    pub fn on_model_update<F>(&self, listener: F) -> FormResult<()>
    where
        F: Fn(&ModelUpdate) + Send + Sync + 'static,
    {
        write_lock(&self.cell.listeners, "adding model listener")?.push(Arc::new(listener));
        Ok(())
    }

    /// Accepts a value pushed from outside under `prop`. Returns whether it
    /// was applied; pushes equal to the current value are ignored and are not
    /// echoed back to listeners.
    pub fn push_prop(&self, prop: &str, value: Value) -> FormResult<bool> {
        let sync = &self.cell.options.model_sync;
        if !sync.enabled || sync.prop != prop {
            return Ok(false);
        }
        if self.value()? == value {
            return Ok(false);
        }
        trace!(path = %self.cell.path, prop, "model value pushed");
        if let Some(run) = self.write_value(value, true, false)? {
            self.dispatch(run)?;
        }
        Ok(true)
    }

    pub(super) fn emit_model_update(&self, value: &Value) -> FormResult<()> {
        let sync = &self.cell.options.model_sync;
        if !sync.enabled {
            return Ok(());
        }
        let listeners = read_lock(&self.cell.listeners, "reading model listeners")?.clone();
        if listeners.is_empty() {
            return Ok(());
        }
        let update = ModelUpdate {
            event: sync.event.clone(),
            path: self.cell.path.clone(),
            value: value.clone(),
        };
        for listener in listeners {
            listener(&update);
        }
        Ok(())
    }
}

/// Get/set view over one field's value, resolved by path on every access.
#[derive(Clone)]
pub struct FieldModel {
    path: FieldPath,
    form: Weak<FormInner>,
}

impl Debug for FieldModel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldModel")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl FieldModel {
    pub fn path(&self) -> &FieldPath {
        &self.path
    }

    pub fn get(&self) -> FormResult<Value> {
        self.resolve()?.value()
    }

    /// Writes the value under the form's
    /// [`validate_on_value_update`](super::FormOptions::validate_on_value_update)
    /// policy. A field-level override does not apply to model writes.
    pub fn set(&self, value: Value) -> FormResult<()> {
        let field = self.resolve()?;
        if let Some(run) = field.write_value_by_form_policy(value)? {
            field.dispatch(run)?;
        }
        Ok(())
    }

    fn resolve(&self) -> FormResult<FieldHandle> {
        let form = self.form.upgrade().ok_or(FormError::Detached)?;
        FormController { inner: form }.require_field(&self.path)
    }
}

impl FormController {
    pub fn field_model(&self, path: impl IntoFieldPath) -> FormResult<FieldModel> {
        Ok(FieldModel {
            path: path.into_field_path()?,
            form: Arc::downgrade(&self.inner),
        })
    }

    pub fn field_models<P, I>(&self, paths: I) -> FormResult<Vec<FieldModel>>
    where
        P: IntoFieldPath,
        I: IntoIterator<Item = P>,
    {
        paths.into_iter().map(|path| self.field_model(path)).collect()
    }

    /// First error of a field, withheld until the field is touched or the
    /// form has been submitted.
    pub fn display_error(&self, path: impl IntoFieldPath) -> FormResult<Option<String>> {
        let Some(field) = self.field(path)? else {
            return Ok(None);
        };
        let touched = field.meta()?.touched;
        if !touched && self.meta()?.submit_count == 0 {
            return Ok(None);
        }
        field.error_message()
    }
}
