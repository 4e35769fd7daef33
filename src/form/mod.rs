mod binding;
mod controller;
mod diagnostics;
mod executor;
mod field;
mod schema;
mod validation;

#[cfg(test)]
mod tests;

pub use binding::{DEFAULT_MODEL_EVENT, DEFAULT_MODEL_PROP, FieldModel, ModelSync, ModelUpdate};
pub use calmform_derive::FormModel;
pub use controller::{
    FormController, FormError, FormId, FormMeta, FormOptions, FormResult, InvalidSubmitHandler,
    SubmitState, ValidationSpawner, ValidationTicket,
};
pub use diagnostics::{Diagnostics, TracingDiagnostics};
pub use executor::{FieldValidation, ValidationRun};
pub use field::{FieldHandle, FieldMeta, FieldOptions};
pub use schema::{
    FieldRule, Outcome, RuleContext, RuleOutput, Schema, SchemaAdapter, SchemaIssue,
    SchemaResolver, StructuredSchema, ValidatorFailure, Verdict,
};
pub use validation::{FieldErrors, FormModel, FormValidation, InvalidSubmit, SubmitOutcome};
