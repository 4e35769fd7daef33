pub use crate::form::{
    Diagnostics, FieldHandle, FieldMeta, FieldModel, FieldOptions, FieldRule, FieldValidation,
    FormController, FormError, FormMeta, FormModel, FormOptions, FormResult, FormValidation,
    InvalidSubmit, ModelSync, ModelUpdate, RuleContext, RuleOutput, Schema, SchemaIssue,
    StructuredSchema, SubmitOutcome, SubmitState, ValidationRun, Verdict,
};
pub use crate::path::{FieldPath, IntoFieldPath};
