//! Schema adapter: turns the supported schema shapes into one validation
//! contract.
//!
//! A [`Schema`] is inspected once, when it is handed to the form, and
//! resolved into a [`SchemaAdapter`]. Every validation afterwards dispatches
//! on the resolved variant:
//!
//! - [`Schema::Resolver`]: a function from field path to [`FieldRule`];
//! - [`Schema::Rules`]: a map of path to [`FieldRule`], keys normalized
//!   through [`FieldPath`] parsing;
//! - [`Schema::Structured`]: an opaque [`StructuredSchema`] that validates the
//!   whole value tree and reports issues by path.
//!
//! Validators answer with anything convertible into a [`Verdict`]: `true`,
//! a message, a list of messages, a JSON value, or a deferred variant of any
//! of those built with [`RuleOutput::deferred`].

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use serde_json::Value;
use thiserror::Error;
use tracing::trace;

use super::diagnostics::Diagnostics;
use crate::path::FieldPath;

/// A validator that could not produce a verdict: it returned an error or
/// panicked.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{message}")]
pub struct ValidatorFailure {
    message: String,
}

impl ValidatorFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub(super) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let detail = if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "unknown panic".to_string()
        };
        Self::new(format!("validator panicked: {detail}"))
    }
}

/// A validation result that is either available now or still being computed.
pub enum Outcome<T> {
    Ready(Result<T, ValidatorFailure>),
    Deferred(BoxFuture<'static, Result<T, ValidatorFailure>>),
}

impl<T: Send + 'static> Outcome<T> {
    pub fn ready(value: T) -> Self {
        Self::Ready(Ok(value))
    }

    pub fn failed(failure: ValidatorFailure) -> Self {
        Self::Ready(Err(failure))
    }

    pub fn from_future<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, ValidatorFailure>> + Send + 'static,
    {
        Self::Deferred(future.boxed())
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn map<U, F>(self, f: F) -> Outcome<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        match self {
            Self::Ready(result) => Outcome::Ready(result.map(f)),
            Self::Deferred(future) => {
                Outcome::Deferred(future.map(move |result| result.map(f)).boxed())
            }
        }
    }

    /// Awaits the result. A panic inside a deferred validator becomes a
    /// [`ValidatorFailure`].
    pub async fn resolve(self) -> Result<T, ValidatorFailure> {
        match self {
            Self::Ready(result) => result,
            Self::Deferred(future) => AssertUnwindSafe(future)
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(ValidatorFailure::from_panic(payload))),
        }
    }
}

impl<T: Debug> Debug for Outcome<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready(result) => f.debug_tuple("Ready").field(result).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// Polls `future` once; a future that completes immediately becomes a ready
/// outcome.
fn eager<T: Send + 'static>(
    mut future: BoxFuture<'static, Result<T, ValidatorFailure>>,
) -> Outcome<T> {
    match (&mut future).now_or_never() {
        Some(result) => Outcome::Ready(result),
        None => Outcome::Deferred(future),
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Verdict {
    Valid,
    Invalid(Vec<String>),
    /// Failed without a message; rendered as `"{label} is not valid."`.
    NotValid,
    /// The validator returned something outside the return contract.
    Unsupported(String),
}

impl Verdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }

    /// Messages to record on the field, or the misconfiguration detail.
    pub fn into_messages(self, label: &str) -> Result<Vec<String>, String> {
        match self {
            Self::Valid => Ok(Vec::new()),
            Self::Invalid(messages) => Ok(messages),
            Self::NotValid => Ok(vec![format!("{label} is not valid.")]),
            Self::Unsupported(detail) => Err(detail),
        }
    }
}

impl From<bool> for Verdict {
    fn from(valid: bool) -> Self {
        if valid { Self::Valid } else { Self::NotValid }
    }
}

impl From<String> for Verdict {
    fn from(message: String) -> Self {
        if message.is_empty() {
            Self::Valid
        } else {
            Self::Invalid(vec![message])
        }
    }
}

impl From<&str> for Verdict {
    fn from(message: &str) -> Self {
        Self::from(message.to_string())
    }
}

impl From<Vec<String>> for Verdict {
    fn from(mut messages: Vec<String>) -> Self {
        messages.retain(|message| !message.is_empty());
        if messages.is_empty() {
            Self::Valid
        } else {
            Self::Invalid(messages)
        }
    }
}

impl From<Vec<&str>> for Verdict {
    fn from(messages: Vec<&str>) -> Self {
        Self::from(
            messages
                .into_iter()
                .map(str::to_string)
                .collect::<Vec<_>>(),
        )
    }
}

impl From<Option<String>> for Verdict {
    fn from(message: Option<String>) -> Self {
        message.map_or(Self::Valid, Self::from)
    }
}

impl From<Result<(), String>> for Verdict {
    fn from(result: Result<(), String>) -> Self {
        match result {
            Ok(()) => Self::Valid,
            Err(message) => Self::from(message),
        }
    }
}

impl From<Value> for Verdict {
    fn from(value: Value) -> Self {
        match value {
            Value::Bool(valid) => Self::from(valid),
            Value::String(message) => Self::from(message),
            Value::Array(items) => {
                let mut messages = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::String(message) => messages.push(message),
                        other => {
                            return Self::Unsupported(format!(
                                "validator returned a list containing `{other}`"
                            ));
                        }
                    }
                }
                Self::from(messages)
            }
            other => Self::Unsupported(format!("validator returned `{other}`")),
        }
    }
}

/// What a [`FieldRule`] returns.
pub type RuleOutput = Outcome<Verdict>;

impl Outcome<Verdict> {
    pub fn deferred<F, V>(future: F) -> Self
    where
        F: Future<Output = V> + Send + 'static,
        V: Into<Verdict>,
    {
        Self::Deferred(future.map(|verdict| Ok(verdict.into())).boxed())
    }

    /// Deferred rule whose error is a validator failure rather than a
    /// validation message.
    pub fn try_deferred<F, V, E>(future: F) -> Self
    where
        F: Future<Output = Result<V, E>> + Send + 'static,
        V: Into<Verdict>,
        E: Display,
    {
        Self::Deferred(
            future
                .map(|result| {
                    result
                        .map(Into::into)
                        .map_err(|error| ValidatorFailure::new(error.to_string()))
                })
                .boxed(),
        )
    }
}

macro_rules! ready_rule_output {
    ($($source:ty),* $(,)?) => {$(
        impl From<$source> for Outcome<Verdict> {
            fn from(value: $source) -> Self {
                Outcome::Ready(Ok(Verdict::from(value)))
            }
        }
    )*};
}

ready_rule_output!(
    bool,
    &str,
    String,
    Vec<String>,
    Vec<&str>,
    Option<String>,
    Result<(), String>,
    Value,
    Verdict,
);

#[derive(Clone, Debug, PartialEq)]
pub struct RuleContext {
    pub path: FieldPath,
    pub label: String,
    /// Snapshot of all form values taken when the run started.
    pub values: Value,
}

impl RuleContext {
    pub fn value_at(&self, path: &str) -> Option<&Value> {
        FieldPath::parse(path)
            .ok()
            .and_then(|path| path.get(&self.values))
    }
}

type RuleFn = dyn Fn(&Value, &RuleContext) -> RuleOutput + Send + Sync;

#[derive(Clone)]
pub struct FieldRule(Arc<RuleFn>);

impl FieldRule {
    pub fn new<F, R>(rule: F) -> Self
    where
        F: Fn(&Value, &RuleContext) -> R + Send + Sync + 'static,
        R: Into<RuleOutput>,
    {
        Self(Arc::new(move |value: &Value, ctx: &RuleContext| {
            rule(value, ctx).into()
        }))
    }

    /// Runs every rule and concatenates their messages in order.
    pub fn all(rules: impl IntoIterator<Item = FieldRule>) -> Self {
        let rules = rules.into_iter().collect::<Vec<_>>();
        Self::new(move |value: &Value, ctx: &RuleContext| {
            let outcomes = rules
                .iter()
                .map(|rule| rule.check(value, ctx))
                .collect::<Vec<_>>();
            let label = ctx.label.clone();
            eager(
                async move {
                    let results = join_all(outcomes.into_iter().map(Outcome::resolve)).await;
                    combine(results, &label)
                }
                .boxed(),
            )
        })
    }

    pub fn check(&self, value: &Value, ctx: &RuleContext) -> RuleOutput {
        (self.0)(value, ctx)
    }
}

impl Debug for FieldRule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("FieldRule(..)")
    }
}

fn combine(
    results: Vec<Result<Verdict, ValidatorFailure>>,
    label: &str,
) -> Result<Verdict, ValidatorFailure> {
    let mut messages = Vec::new();
    for result in results {
        match result?.into_messages(label) {
            Ok(mut next) => messages.append(&mut next),
            Err(detail) => return Ok(Verdict::Unsupported(detail)),
        }
    }
    Ok(Verdict::from(messages))
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SchemaIssue {
    pub path: String,
    pub message: String,
}

impl SchemaIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// A third-party schema validating the whole value tree at once.
pub trait StructuredSchema: Send + Sync {
    fn validate(&self, values: &Value) -> Outcome<Vec<SchemaIssue>>;

    /// Human-readable name used in default messages.
    fn label(&self, _path: &FieldPath) -> Option<String> {
        None
    }
}

pub type SchemaResolver = Arc<dyn Fn(&FieldPath) -> Option<FieldRule> + Send + Sync>;

#[derive(Clone, Default)]
pub enum Schema {
    #[default]
    None,
    Resolver(SchemaResolver),
    Rules(Vec<(String, FieldRule)>),
    Structured(Arc<dyn StructuredSchema>),
}

impl Schema {
    pub fn resolver<F>(resolver: F) -> Self
    where
        F: Fn(&FieldPath) -> Option<FieldRule> + Send + Sync + 'static,
    {
        Self::Resolver(Arc::new(resolver))
    }

    pub fn rules<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, FieldRule)>,
        K: Into<String>,
    {
        Self::Rules(
            entries
                .into_iter()
                .map(|(key, rule)| (key.into(), rule))
                .collect(),
        )
    }

    pub fn structured(schema: impl StructuredSchema + 'static) -> Self {
        Self::Structured(Arc::new(schema))
    }
}

impl Debug for Schema {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Resolver(_) => f.write_str("Resolver(..)"),
            Self::Rules(entries) => f
                .debug_list()
                .entries(entries.iter().map(|(key, _)| key))
                .finish(),
            Self::Structured(_) => f.write_str("Structured(..)"),
        }
    }
}

enum AdapterKind {
    Empty,
    Resolver(SchemaResolver),
    Rules(BTreeMap<FieldPath, FieldRule>),
    Structured(Arc<dyn StructuredSchema>),
}

pub struct SchemaAdapter {
    kind: AdapterKind,
}

impl SchemaAdapter {
    pub fn empty() -> Self {
        Self {
            kind: AdapterKind::Empty,
        }
    }

    /// Inspects `schema` once. Rule keys that are not valid paths are
    /// reported and skipped.
    pub fn resolve(schema: Schema, diagnostics: &dyn Diagnostics) -> Self {
        let kind = match schema {
            Schema::None => AdapterKind::Empty,
            Schema::Resolver(resolver) => AdapterKind::Resolver(resolver),
            Schema::Structured(schema) => AdapterKind::Structured(schema),
            Schema::Rules(entries) => {
                let mut rules = BTreeMap::new();
                for (key, rule) in entries {
                    match FieldPath::parse(&key) {
                        Ok(path) => {
                            rules.insert(path, rule);
                        }
                        Err(error) => {
                            diagnostics.misconfigured(None, &format!("schema key skipped: {error}"))
                        }
                    }
                }
                AdapterKind::Rules(rules)
            }
        };
        Self { kind }
    }

    pub fn is_structured(&self) -> bool {
        matches!(self.kind, AdapterKind::Structured(_))
    }

    pub fn rule_for(&self, path: &FieldPath) -> Option<FieldRule> {
        match &self.kind {
            AdapterKind::Resolver(resolver) => resolver.as_ref()(path),
            AdapterKind::Rules(rules) => rules.get(path).cloned(),
            AdapterKind::Empty | AdapterKind::Structured(_) => None,
        }
    }

    pub fn label(&self, path: &FieldPath) -> Option<String> {
        match &self.kind {
            AdapterKind::Structured(schema) => schema.label(path),
            _ => None,
        }
    }

    /// Validates one field. Structured schemas validate the whole tree and
    /// keep the issues reported for `ctx.path`.
    pub fn validate_field(&self, value: &Value, ctx: &RuleContext) -> Outcome<Verdict> {
        if let AdapterKind::Structured(schema) = &self.kind {
            let path = ctx.path.clone();
            return schema
                .validate(&ctx.values)
                .map(move |issues| Verdict::from(messages_for(&path, issues)));
        }
        match self.rule_for(&ctx.path) {
            Some(rule) => rule.check(value, ctx),
            None => Outcome::ready(Verdict::Valid),
        }
    }

    /// Validates `fields` against `values` in one pass. Structured schemas
    /// also report paths outside `fields`; unsupported verdicts are left out.
    pub fn validate_all(
        &self,
        values: &Value,
        fields: &[FieldPath],
    ) -> Outcome<BTreeMap<FieldPath, Vec<String>>> {
        if let AdapterKind::Structured(schema) = &self.kind {
            return schema.validate(values).map(group_issues);
        }

        let mut pending = Vec::with_capacity(fields.len());
        for path in fields {
            let Some(rule) = self.rule_for(path) else {
                continue;
            };
            let ctx = RuleContext {
                path: path.clone(),
                label: path.to_string(),
                values: values.clone(),
            };
            let value = path.get(values).cloned().unwrap_or(Value::Null);
            let outcome = rule.check(&value, &ctx);
            pending.push((ctx, outcome));
        }

        eager(
            async move {
                let mut errors = BTreeMap::new();
                for (ctx, outcome) in pending {
                    let verdict = outcome.resolve().await?;
                    if let Ok(messages) = verdict.into_messages(&ctx.label) {
                        errors.insert(ctx.path, messages);
                    }
                }
                Ok::<_, ValidatorFailure>(errors)
            }
            .boxed(),
        )
    }
}

fn messages_for(path: &FieldPath, issues: Vec<SchemaIssue>) -> Vec<String> {
    issues
        .into_iter()
        .filter(|issue| FieldPath::parse(&issue.path).is_ok_and(|candidate| &candidate == path))
        .map(|issue| issue.message)
        .collect()
}

fn group_issues(issues: Vec<SchemaIssue>) -> BTreeMap<FieldPath, Vec<String>> {
    let mut grouped = BTreeMap::<FieldPath, Vec<String>>::new();
    for issue in issues {
        match FieldPath::parse(&issue.path) {
            Ok(path) => grouped.entry(path).or_default().push(issue.message),
            Err(error) => trace!(%error, "schema issue without a usable path dropped"),
        }
    }
    grouped
}
