//! Validation orchestration for reactive forms.
//!
//! A [`form::FormController`] owns a registry of fields addressed by
//! [`path::FieldPath`]. Each field validates against its own rule or the
//! form's schema; runs carry per-field tickets so a slow, superseded run can
//! never overwrite the result of a newer one.

pub mod form;
pub mod path;
pub mod prelude;
