use super::*;
use crate::path::FieldPath;
use futures::FutureExt;
use futures::channel::oneshot;
use futures::executor::block_on;
use futures::future::{FutureObj, ready};
use futures::stream;
use futures::task::{Spawn, SpawnError};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing_test::traced_test;

type Gate = oneshot::Sender<Vec<String>>;

fn path(input: &str) -> FieldPath {
    FieldPath::parse(input).expect("path should parse")
}

fn required() -> FieldRule {
    FieldRule::new(|value: &Value, ctx: &RuleContext| {
        let filled = match value {
            Value::Null => false,
            Value::String(text) => !text.is_empty(),
            _ => true,
        };
        if filled {
            Ok(())
        } else {
            Err(format!("{} is required", ctx.label))
        }
    })
}

fn counting(calls: Arc<AtomicUsize>) -> FieldRule {
    FieldRule::new(move |_: &Value, _: &RuleContext| {
        calls.fetch_add(1, Ordering::SeqCst);
        true
    })
}

/// A rule whose every invocation waits until the test opens its gate.
fn gated_rule() -> (FieldRule, Arc<Mutex<VecDeque<Gate>>>) {
    let gates = Arc::new(Mutex::new(VecDeque::new()));
    let senders = gates.clone();
    let rule = FieldRule::new(move |_: &Value, _: &RuleContext| {
        let (sender, receiver) = oneshot::channel::<Vec<String>>();
        senders.lock().expect("gates lock").push_back(sender);
        RuleOutput::try_deferred(receiver)
    });
    (rule, gates)
}

fn next_gate(gates: &Mutex<VecDeque<Gate>>) -> Gate {
    gates
        .lock()
        .expect("gates lock")
        .pop_front()
        .expect("a validator should be waiting")
}

fn min_length(min: usize) -> FieldRule {
    FieldRule::new(move |value: &Value, _: &RuleContext| {
        let text = value.as_str().unwrap_or_default().to_string();
        RuleOutput::deferred(async move {
            if text.chars().count() < min {
                vec![format!("Use at least {min} characters")]
            } else {
                Vec::new()
            }
        })
    })
}

#[derive(Debug, Deserialize, PartialEq, Serialize, crate::form::FormModel)]
struct Profile {
    name: String,
    age: u32,
}

#[derive(Default)]
struct QueueSpawner {
    tasks: Mutex<Vec<FutureObj<'static, ()>>>,
}

impl Spawn for QueueSpawner {
    fn spawn_obj(&self, future: FutureObj<'static, ()>) -> Result<(), SpawnError> {
        self.tasks.lock().expect("tasks lock").push(future);
        Ok(())
    }
}

struct SignupSchema {
    calls: Arc<AtomicUsize>,
}

impl StructuredSchema for SignupSchema {
    fn validate(&self, values: &Value) -> Outcome<Vec<SchemaIssue>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut issues = Vec::new();
        if !values["email"].as_str().is_some_and(|email| email.contains('@')) {
            issues.push(SchemaIssue::new("email", "Enter a valid email"));
        }
        if values["password"].as_str().is_none_or(|password| password.len() < 8) {
            issues.push(SchemaIssue::new("password", "Password is too short"));
        }
        Outcome::from_future(async move { Ok(issues) })
    }

    fn label(&self, path: &FieldPath) -> Option<String> {
        (path.as_str() == "email").then(|| "Email address".to_string())
    }
}

#[test]
fn later_run_wins_when_earlier_run_completes_last() {
    let form = FormController::default();
    let (rule, gates) = gated_rule();
    let email = form
        .register_with("email", FieldOptions::default().rule(rule))
        .expect("register email");

    let mut first = email.validate().expect("first run");
    let second = email.validate().expect("second run");
    assert!(first.ticket() < second.ticket());
    assert!((&mut first).now_or_never().is_none());
    assert!(email.meta().expect("meta").pending);
    assert!(form.meta().expect("form meta").pending);

    let first_gate = next_gate(&gates);
    let second_gate = next_gate(&gates);

    second_gate.send(Vec::new()).expect("open second gate");
    let latest = block_on(second).expect("second run");
    assert!(latest.applied);
    assert!(latest.valid);

    first_gate
        .send(vec!["Email is taken".to_string()])
        .expect("open first gate");
    let stale = block_on(first).expect("first run");
    assert!(!stale.applied);

    assert!(email.errors().expect("errors").is_empty());
    let meta = email.meta().expect("meta");
    assert!(meta.valid);
    assert!(!meta.pending);
    assert!(!form.meta().expect("form meta").pending);
}

#[test]
fn stale_completion_leaves_newer_run_pending() {
    let form = FormController::default();
    let (rule, gates) = gated_rule();
    let field = form
        .register_with("username", FieldOptions::default().rule(rule))
        .expect("register username");

    let first = field.validate().expect("first run");
    let second = field.validate().expect("second run");
    let first_gate = next_gate(&gates);
    let second_gate = next_gate(&gates);

    first_gate
        .send(vec!["stale".to_string()])
        .expect("open first gate");
    assert!(!block_on(first).expect("first run").applied);
    assert!(field.meta().expect("meta").pending);
    assert!(field.errors().expect("errors").is_empty());

    second_gate
        .send(vec!["Username is taken".to_string()])
        .expect("open second gate");
    let latest = block_on(second).expect("second run");
    assert!(latest.applied);
    assert_eq!(latest.errors, vec!["Username is taken".to_string()]);
    assert!(!field.meta().expect("meta").pending);
    assert!(!form.meta().expect("form meta").valid);
}

#[test]
fn reset_discards_in_flight_runs() {
    let form = FormController::default();
    let (rule, gates) = gated_rule();
    let name = form
        .register_with(
            "name",
            FieldOptions::default()
                .initial_value(json!("Ada"))
                .rule(rule),
        )
        .expect("register name");

    name.set_touched(true).expect("touch");
    name.set_value_with(json!("Grace"), false).expect("set value");
    let run = name.validate().expect("run");
    name.reset().expect("reset");

    next_gate(&gates)
        .send(vec!["Name is invalid".to_string()])
        .expect("open gate");
    assert!(!block_on(run).expect("run").applied);

    assert_eq!(name.value().expect("value"), json!("Ada"));
    assert!(name.errors().expect("errors").is_empty());
    assert_eq!(name.meta().expect("meta"), FieldMeta::default());
    let meta = form.meta().expect("form meta");
    assert!(!meta.dirty);
    assert!(!meta.touched);
    assert!(!meta.pending);
}

#[test]
fn reset_to_replaces_the_initial_value() {
    let form = FormController::default();
    let field = form
        .register("city", Some(json!("Oslo")))
        .expect("register city");
    field.set_value(json!("Bergen")).expect("set value");
    field.reset_to(json!("Bergen")).expect("reset to");

    assert_eq!(field.initial_value().expect("initial"), Some(json!("Bergen")));
    assert!(!field.meta().expect("meta").dirty);
    field.set_value(json!("Oslo")).expect("set value");
    assert!(field.meta().expect("meta").dirty);
}

#[test]
fn unregister_discards_in_flight_runs() {
    let form = FormController::default();
    let (rule, gates) = gated_rule();
    let field = form
        .register_with("coupon", FieldOptions::default().rule(rule))
        .expect("register coupon");
    let run = field.validate().expect("run");
    assert!(form.meta().expect("form meta").pending);

    assert!(form.unregister("coupon").expect("unregister"));
    assert!(!form.meta().expect("form meta").pending);
    assert!(!field.is_registered());

    next_gate(&gates)
        .send(vec!["Expired".to_string()])
        .expect("open gate");
    assert!(!block_on(run).expect("run").applied);
    assert!(form.errors().expect("errors").is_empty());
}

#[test]
fn aggregate_validity_is_vacuous_until_a_field_fails() {
    let form = FormController::default();
    assert!(form.is_empty().expect("is empty"));
    assert!(form.meta().expect("meta").valid);

    let age = form
        .register_with(
            "age",
            FieldOptions::default().rule(FieldRule::new(|value: &Value, _: &RuleContext| {
                value.as_u64().is_some_and(|age| age >= 18)
            })),
        )
        .expect("register age");
    assert!(form.meta().expect("meta").valid);

    let validation = block_on(form.validate()).expect("validate");
    assert!(!validation.valid);
    assert_eq!(
        validation.errors.get(&path("age")),
        Some(&vec!["age is not valid.".to_string()])
    );
    assert!(!form.meta().expect("meta").valid);

    age.set_value(json!(21)).expect("set age");
    assert!(age.errors().expect("errors").is_empty());
    assert!(form.meta().expect("meta").valid);
}

#[test]
fn form_validation_issues_every_ticket_before_awaiting() {
    let form = FormController::default();
    let (rule, gates) = gated_rule();
    for name in ["first", "second"] {
        form.register_with(name, FieldOptions::default().rule(rule.clone()))
            .expect("register field");
    }

    let mut pass = Box::pin(form.validate());
    assert!((&mut pass).now_or_never().is_none());
    for name in ["first", "second"] {
        let field = form.field(name).expect("lookup").expect("field");
        assert!(field.meta().expect("meta").pending);
    }

    next_gate(&gates)
        .send(vec!["First failed".to_string()])
        .expect("open first gate");
    next_gate(&gates).send(Vec::new()).expect("open second gate");
    let validation = block_on(pass).expect("validate");

    assert!(!validation.valid);
    assert_eq!(validation.errors.len(), 1);
    assert!(validation.errors.contains_key(&path("first")));
    assert!(!form.meta().expect("meta").pending);
}

#[test]
fn schema_replacement_revalidates_only_validated_fields() {
    let form = FormController::with_schema(
        Schema::rules([("a", required()), ("b", required())]),
        FormOptions::default(),
    );
    let a = form.register("a", None).expect("register a");
    let b = form.register("b", None).expect("register b");

    let run = a.validate().expect("validate a");
    assert!(run.is_settled());
    assert!(!block_on(run).expect("run").valid);
    assert_eq!(a.errors().expect("errors"), vec!["a is required".to_string()]);

    let calls = Arc::new(AtomicUsize::new(0));
    form.set_validation_schema(Schema::rules([
        ("a", counting(calls.clone())),
        ("b", counting(calls.clone())),
    ]))
    .expect("replace schema");

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(a.errors().expect("errors").is_empty());
    assert!(!b.meta().expect("meta").validated);
    assert!(b.errors().expect("errors").is_empty());
}

#[test]
fn schema_replacement_flags_only_previously_validated_fields() {
    let form = FormController::with_schema(
        Schema::rules([("a", required()), ("b", required())]),
        FormOptions::default(),
    );
    let a = form.register("a", Some(json!("alpha"))).expect("register a");
    let b = form.register("b", Some(json!("beta"))).expect("register b");
    assert!(block_on(b.validate().expect("validate b")).expect("run").valid);

    let taken = || {
        FieldRule::new(|_: &Value, ctx: &RuleContext| {
            Err::<(), _>(format!("{} is taken", ctx.label))
        })
    };
    form.set_validation_schema(Schema::rules([("a", taken()), ("b", taken())]))
        .expect("replace schema");

    assert!(a.errors().expect("errors").is_empty());
    assert!(!a.meta().expect("meta").validated);
    assert_eq!(b.errors().expect("errors"), vec!["b is taken".to_string()]);
    assert!(!form.meta().expect("meta").valid);
}

#[test]
fn follow_schema_applies_each_schema_from_the_stream() {
    let form = FormController::default();
    let name = form.register("name", Some(json!(""))).expect("register name");
    assert!(block_on(name.validate().expect("run")).expect("run").valid);

    block_on(form.follow_schema(stream::iter(vec![Schema::rules([("name", required())])])))
        .expect("follow schema");
    assert_eq!(
        name.errors().expect("errors"),
        vec!["name is required".to_string()]
    );

    block_on(form.follow_schema(stream::iter(vec![Schema::None]))).expect("follow schema");
    assert!(name.errors().expect("errors").is_empty());
}

#[test]
fn resolver_schema_and_field_rules_compose() {
    let form = FormController::with_schema(
        Schema::resolver(|path: &FieldPath| (path.as_str() != "nickname").then(required)),
        FormOptions::default(),
    );
    let confirm = FieldRule::new(|value: &Value, ctx: &RuleContext| {
        if Some(value) == ctx.value_at("password") {
            Ok(())
        } else {
            Err("Passwords do not match".to_string())
        }
    });
    form.register("password", Some(json!("hunter22")))
        .expect("register password");
    form.register_with(
        "confirm",
        FieldOptions::default()
            .initial_value(json!("hunter2"))
            .label("Confirmation")
            .rule(confirm),
    )
    .expect("register confirm");
    form.register("nickname", None).expect("register nickname");

    let validation = block_on(form.validate()).expect("validate");
    assert_eq!(
        validation.errors,
        BTreeMap::from([(path("confirm"), vec!["Passwords do not match".to_string()])])
    );

    form.set_field_value("confirm", json!("hunter22"))
        .expect("set confirm");
    assert!(form.meta().expect("meta").valid);
}

#[test]
fn structured_schema_runs_once_per_form_pass() {
    let calls = Arc::new(AtomicUsize::new(0));
    let form = FormController::with_schema(
        Schema::structured(SignupSchema {
            calls: calls.clone(),
        }),
        FormOptions::default(),
    );
    let email = form.register("email", Some(json!("ada"))).expect("register email");
    form.register("password", Some(json!("short")))
        .expect("register password");
    form.register("remember", Some(json!(true)))
        .expect("register remember");

    let validation = block_on(form.validate()).expect("validate");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(validation.errors.len(), 2);
    assert_eq!(
        validation.errors.get(&path("email")),
        Some(&vec!["Enter a valid email".to_string()])
    );

    email
        .set_value_with(json!("ada@calm.dev"), false)
        .expect("set email");
    let run = email.validate().expect("validate email");
    assert!(block_on(run).expect("run").valid);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn submit_is_gated_on_validity() {
    let form = FormController::with_schema(
        Schema::rules([("email", required())]),
        FormOptions::default(),
    );
    let email = form.register("email", Some(json!(""))).expect("register email");
    let submitted = AtomicUsize::new(0);
    let mut rejected = Vec::new();

    let outcome = block_on(form.handle_submit_with(
        |_values| {
            submitted.fetch_add(1, Ordering::SeqCst);
            ready(Ok(()))
        },
        |invalid: &InvalidSubmit| rejected.push(invalid.errors.clone()),
    ))
    .expect("submit");
    assert!(!outcome.is_submitted());
    assert_eq!(submitted.load(Ordering::SeqCst), 0);
    assert_eq!(
        rejected,
        vec![BTreeMap::from([(
            path("email"),
            vec!["email is required".to_string()]
        )])]
    );
    let meta = form.meta().expect("meta");
    assert_eq!(meta.submit_state, SubmitState::Failed);
    assert_eq!(meta.submit_count, 1);

    email.set_value(json!("ada@calm.dev")).expect("set email");
    let outcome = block_on(form.handle_submit(|values| {
        submitted.fetch_add(1, Ordering::SeqCst);
        ready(Ok(values["email"].clone()))
    }))
    .expect("submit");
    assert_eq!(outcome, SubmitOutcome::Submitted(json!("ada@calm.dev")));
    assert_eq!(submitted.load(Ordering::SeqCst), 1);
    let meta = form.meta().expect("meta");
    assert_eq!(meta.submit_state, SubmitState::Succeeded);
    assert_eq!(meta.submit_count, 2);
}

#[test]
fn invalid_submit_falls_back_to_the_form_handler() {
    let seen = Arc::new(AtomicUsize::new(0));
    let handler_seen = seen.clone();
    let form = FormController::with_schema(
        Schema::rules([("name", required())]),
        FormOptions {
            on_invalid_submit: Some(Arc::new(move |invalid: &InvalidSubmit| {
                assert_eq!(invalid.values, json!({ "name": null }));
                handler_seen.fetch_add(1, Ordering::SeqCst);
            })),
            ..FormOptions::default()
        },
    );
    form.register("name", None).expect("register name");

    let outcome = block_on(form.handle_submit(|_values| ready(Ok(()))))
        .expect("submit");
    assert!(matches!(outcome, SubmitOutcome::Invalid(errors) if errors.len() == 1));
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[test]
fn failing_submit_callback_marks_submit_failed() {
    let form = FormController::default();
    form.register("name", Some(json!("Ada"))).expect("register name");

    let result = block_on(form.handle_submit(|_values| {
        ready(Err::<(), _>(FormError::Serialization("rejected".into())))
    }));
    assert!(result.is_err());
    assert_eq!(
        form.meta().expect("meta").submit_state,
        SubmitState::Failed
    );
}

#[test]
fn typed_submit_deserializes_registered_model() {
    let form = FormController::default();
    let handles = form
        .register_model(&Profile {
            name: "Ada".into(),
            age: 36,
        })
        .expect("register model");
    assert_eq!(handles.len(), 2);

    let fields = Profile::fields();
    assert_eq!(fields.age(), path("age"));
    assert_eq!(Profile::field_paths(), &["name", "age"]);

    form.set_field_value(fields.age(), json!(37)).expect("set age");
    let outcome = block_on(form.handle_submit_as(|profile: Profile| ready(Ok(profile))))
        .expect("submit");
    assert_eq!(
        outcome,
        SubmitOutcome::Submitted(Profile {
            name: "Ada".into(),
            age: 37,
        })
    );

    form.set_field_value(fields.age(), json!("old")).expect("set age");
    let result = block_on(form.handle_submit_as(|profile: Profile| ready(Ok(profile))));
    assert!(matches!(result, Err(FormError::Serialization(_))));
    assert_eq!(
        form.meta().expect("meta").submit_state,
        SubmitState::Failed
    );
}

#[derive(Debug, Deserialize, PartialEq, Serialize, crate::form::FormModel)]
#[serde(rename_all = "camelCase")]
struct Shipping {
    first_name: String,
    postal_code: String,
}

#[test]
fn renamed_models_register_and_submit_under_serialized_keys() {
    let form = FormController::default();
    form.register_model(&Shipping {
        first_name: "Ada".into(),
        postal_code: "0150".into(),
    })
    .expect("register model");

    assert_eq!(Shipping::fields().first_name(), path("firstName"));
    assert_eq!(
        form.values().expect("values"),
        json!({ "firstName": "Ada", "postalCode": "0150" })
    );

    form.set_field_value(Shipping::fields().postal_code(), json!("0151"))
        .expect("set postal code");
    let outcome = block_on(form.handle_submit_as(|shipping: Shipping| ready(Ok(shipping))))
        .expect("submit");
    assert_eq!(
        outcome,
        SubmitOutcome::Submitted(Shipping {
            first_name: "Ada".into(),
            postal_code: "0151".into(),
        })
    );
}

#[test]
fn registration_is_idempotent_and_round_trips() {
    let form = FormController::new(FormOptions {
        initial_values: json!({ "user": { "name": "Ada" } }),
        ..FormOptions::default()
    });
    let name = form.register("user.name", None).expect("register name");
    assert_eq!(name.value().expect("value"), json!("Ada"));

    let again = form
        .register("user.name", Some(json!("Grace")))
        .expect("register again");
    assert_eq!(again.value().expect("value"), json!("Ada"));
    assert_eq!(form.len().expect("len"), 1);

    let tag = form.register("tags.0", Some(json!("rust"))).expect("register tag");
    assert_eq!(tag.path(), &path("tags[0]"));
    assert_eq!(
        form.values().expect("values"),
        json!({ "user": { "name": "Ada" }, "tags": ["rust"] })
    );
    assert_eq!(
        form.meta().expect("meta").initial_values,
        json!({ "user": { "name": "Ada" }, "tags": ["rust"] })
    );

    tag.set_value(json!("go")).expect("set tag");
    assert!(form.meta().expect("meta").dirty);
    assert!(form.unregister("tags[0]").expect("unregister"));
    assert!(!form.unregister("tags[0]").expect("unregister twice"));

    assert_eq!(form.paths().expect("paths"), vec![path("user.name")]);
    assert_eq!(
        form.values().expect("values"),
        json!({ "user": { "name": "Ada" } })
    );
    assert!(!form.meta().expect("meta").dirty);
}

#[test]
fn unregistering_restores_the_previous_form_meta() {
    let form = FormController::default();
    form.register("name", Some(json!("Ada"))).expect("register name");
    let before = form.meta().expect("meta");

    let tag = form.register("tags[0]", Some(json!("rust"))).expect("register tag");
    tag.set_value(json!("go")).expect("set tag");
    tag.set_touched(true).expect("touch tag");
    tag.set_errors(vec!["pick another".into()]).expect("set errors");
    assert_ne!(form.meta().expect("meta"), before);

    assert!(form.unregister("tags[0]").expect("unregister"));
    assert_eq!(form.meta().expect("meta"), before);
}

#[test]
fn malformed_paths_and_unknown_fields_are_errors() {
    let form = FormController::default();
    assert!(matches!(
        form.register("a..b", None),
        Err(FormError::InvalidPath { .. })
    ));
    assert_eq!(
        form.set_field_value("missing", json!(1)),
        Err(FormError::UnknownField(path("missing")))
    );
    assert!(form.field("missing").expect("lookup").is_none());
}

#[test]
fn huge_indices_register_without_breaking_the_form() {
    let form = FormController::default();
    let far = form
        .register("rows[18446744073709551615]", Some(json!("far")))
        .expect("register far row");
    assert_eq!(far.path().as_str(), "rows[18446744073709551615]");
    form.register("rows[0]", Some(json!("first")))
        .expect("register first row");

    let expected = json!({ "rows": { "0": "first", "18446744073709551615": "far" } });
    assert_eq!(form.values().expect("values"), expected);
    assert_eq!(form.meta().expect("meta").initial_values, expected);

    far.set_value(json!("moved")).expect("set far row");
    assert!(form.unregister("rows[18446744073709551615]").expect("unregister"));
    assert_eq!(
        form.values().expect("values"),
        json!({ "rows": ["first"] })
    );
}

#[test]
fn dirty_is_structural_and_sticky_until_reset() {
    let form = FormController::default();
    let address = form
        .register("address", Some(json!({ "city": "Oslo", "zip": "0150" })))
        .expect("register address");

    address
        .set_value(json!({ "zip": "0150", "city": "Oslo" }))
        .expect("set equal value");
    assert!(!address.meta().expect("meta").dirty);

    address
        .set_value(json!({ "city": "Bergen", "zip": "5003" }))
        .expect("set new value");
    assert!(address.meta().expect("meta").dirty);

    address
        .set_value(json!({ "city": "Oslo", "zip": "0150" }))
        .expect("set value back");
    assert!(address.meta().expect("meta").dirty);

    address.reset().expect("reset");
    assert!(!address.meta().expect("meta").dirty);
}

#[test]
fn touched_never_validates() {
    let calls = Arc::new(AtomicUsize::new(0));
    let form = FormController::default();
    let field = form
        .register_with("terms", FieldOptions::default().rule(counting(calls.clone())))
        .expect("register terms");

    field.set_touched(true).expect("touch");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(form.meta().expect("meta").touched);
    assert!(!field.meta().expect("meta").validated);
}

#[test]
fn value_update_policy_can_be_overridden_per_field() {
    let form = FormController::with_schema(
        Schema::rules([("a", required()), ("b", required())]),
        FormOptions {
            validate_on_value_update: false,
            ..FormOptions::default()
        },
    );
    let a = form.register("a", Some(json!("x"))).expect("register a");
    let b = form
        .register_with(
            "b",
            FieldOptions::default()
                .initial_value(json!("x"))
                .validate_on_value_update(true),
        )
        .expect("register b");

    a.set_value(json!("")).expect("set a");
    assert!(a.errors().expect("errors").is_empty());
    assert!(!a.meta().expect("meta").validated);

    b.set_value(json!("")).expect("set b");
    assert_eq!(b.errors().expect("errors"), vec!["b is required".to_string()]);

    b.set_value_with(json!("y"), false).expect("set b quietly");
    assert_eq!(b.errors().expect("errors"), vec!["b is required".to_string()]);
}

#[test]
fn deferred_runs_queue_until_settled() {
    let form = FormController::default();
    let field = form
        .register_with("password", FieldOptions::default().rule(min_length(8)))
        .expect("register password");

    field.set_value(json!("short")).expect("set password");
    assert!(field.meta().expect("meta").pending);
    assert!(form.meta().expect("meta").pending);

    block_on(form.settle()).expect("settle");
    assert_eq!(
        field.errors().expect("errors"),
        vec!["Use at least 8 characters".to_string()]
    );
    assert!(!form.meta().expect("meta").pending);

    block_on(field.set_value_async(json!("long enough"))).expect("set async");
    assert!(field.errors().expect("errors").is_empty());
    assert!(!field.meta().expect("meta").pending);
}

#[test]
fn background_queue_keeps_only_current_runs() {
    let form = FormController::default();
    let field = form
        .register_with("password", FieldOptions::default().rule(min_length(8)))
        .expect("register password");

    for attempt in 0..1000 {
        field
            .set_value(json!(format!("p{attempt}")))
            .expect("set password");
    }
    assert_eq!(form.queued_runs().expect("queued"), 1);

    let validation = block_on(form.validate()).expect("validate");
    assert!(!validation.valid);
    assert_eq!(form.queued_runs().expect("queued"), 0);
    assert!(!field.meta().expect("meta").pending);

    field.set_value(json!("short")).expect("set password");
    assert_eq!(form.queued_runs().expect("queued"), 1);
    assert!(form.unregister("password").expect("unregister"));
    assert_eq!(form.queued_runs().expect("queued"), 0);
    block_on(form.settle()).expect("settle");
}

#[test]
fn deferred_runs_go_to_the_configured_spawner() {
    let spawner = Arc::new(QueueSpawner::default());
    let form = FormController::new(FormOptions {
        spawner: Some(spawner.clone()),
        ..FormOptions::default()
    });
    let field = form
        .register_with("handle", FieldOptions::default().rule(min_length(3)))
        .expect("register handle");

    field.set_value(json!("ab")).expect("set handle");
    block_on(form.settle()).expect("settle");
    assert!(field.meta().expect("meta").pending);

    let tasks = std::mem::take(&mut *spawner.tasks.lock().expect("tasks lock"));
    assert_eq!(tasks.len(), 1);
    for task in tasks {
        block_on(task);
    }
    assert_eq!(
        field.errors().expect("errors"),
        vec!["Use at least 3 characters".to_string()]
    );
    assert!(!field.meta().expect("meta").pending);
}

#[test]
fn debounce_skips_superseded_value_updates() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let rule = FieldRule::new(move |value: &Value, _: &RuleContext| {
        counter.fetch_add(1, Ordering::SeqCst);
        if value.as_str().is_some_and(|text| text.contains("bad")) {
            "Handle is not allowed"
        } else {
            ""
        }
    });
    let form = FormController::default();
    let field = form
        .register_with(
            "handle",
            FieldOptions::default().rule(rule).debounce_ms(20),
        )
        .expect("register handle");

    field.set_value(json!("bad-handle")).expect("first set");
    field.set_value(json!("good-handle")).expect("second set");
    block_on(form.settle()).expect("settle");

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(field.errors().expect("errors").is_empty());
    assert!(!field.meta().expect("meta").pending);

    let run = field.validate().expect("explicit run");
    assert!(run.is_settled());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn model_sync_emits_changes_and_accepts_pushes() {
    let form = FormController::default();
    let title = form
        .register("title", Some(json!("Draft")))
        .expect("register title");
    let updates = Arc::new(Mutex::new(Vec::new()));
    let sink = updates.clone();
    title
        .on_model_update(move |update: &ModelUpdate| {
            sink.lock().expect("updates lock").push(update.clone());
        })
        .expect("subscribe");

    title.set_value(json!("Final")).expect("set title");
    assert_eq!(
        *updates.lock().expect("updates lock"),
        vec![ModelUpdate {
            event: DEFAULT_MODEL_EVENT.to_string(),
            path: path("title"),
            value: json!("Final"),
        }]
    );

    assert!(!title.push_prop(DEFAULT_MODEL_PROP, json!("Final")).expect("push equal"));
    assert!(!title.push_prop("value", json!("Other")).expect("push other prop"));
    assert!(title.push_prop(DEFAULT_MODEL_PROP, json!("Pushed")).expect("push"));
    assert_eq!(title.value().expect("value"), json!("Pushed"));
    assert!(title.meta().expect("meta").dirty);
    assert_eq!(updates.lock().expect("updates lock").len(), 1);

    title.reset().expect("reset");
    let updates = updates.lock().expect("updates lock");
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[1].value, json!("Draft"));
}

#[test]
fn disabled_model_sync_is_silent() {
    let form = FormController::default();
    let field = form
        .register_with(
            "note",
            FieldOptions::default().model_sync(ModelSync::disabled()),
        )
        .expect("register note");
    let emitted = Arc::new(AtomicUsize::new(0));
    let counter = emitted.clone();
    field
        .on_model_update(move |_: &ModelUpdate| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .expect("subscribe");

    field.set_value(json!("hello")).expect("set note");
    assert!(!field.push_prop(DEFAULT_MODEL_PROP, json!("pushed")).expect("push"));
    assert_eq!(emitted.load(Ordering::SeqCst), 0);
    assert_eq!(field.value().expect("value"), json!("hello"));
}

#[test]
fn custom_model_sync_names_are_honoured() {
    let form = FormController::default();
    let field = form
        .register_with(
            "checked",
            FieldOptions::default().model_sync(ModelSync::named("checked", "update:checked")),
        )
        .expect("register checked");
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    field
        .on_model_update(move |update: &ModelUpdate| {
            sink.lock().expect("events lock").push(update.event.clone());
        })
        .expect("subscribe");

    assert!(!field.push_prop(DEFAULT_MODEL_PROP, json!(true)).expect("push default"));
    assert!(field.push_prop("checked", json!(true)).expect("push checked"));
    field.set_value(json!(false)).expect("set checked");
    assert_eq!(
        *events.lock().expect("events lock"),
        vec!["update:checked".to_string()]
    );
}

#[test]
fn field_models_pass_through_to_live_fields() {
    let form = FormController::default();
    form.register("user.name", Some(json!("Ada")))
        .expect("register name");
    let models = form
        .field_models(["user.name", "user.email"])
        .expect("field models");

    assert_eq!(models[0].get().expect("get"), json!("Ada"));
    models[0].set(json!("Grace")).expect("set");
    assert_eq!(
        form.values().expect("values"),
        json!({ "user": { "name": "Grace" } })
    );
    assert_eq!(
        models[1].get(),
        Err(FormError::UnknownField(path("user.email")))
    );

    drop(form);
    assert_eq!(models[0].get(), Err(FormError::Detached));
}

#[test]
fn field_models_use_the_form_trigger_policy() {
    let form = FormController::default();
    let email = form
        .register_with(
            "email",
            FieldOptions::default()
                .rule(required())
                .validate_on_value_update(false),
        )
        .expect("register email");
    email.set_value(json!("")).expect("set email");
    assert!(email.errors().expect("errors").is_empty());

    form.field_model("email")
        .expect("field model")
        .set(json!(""))
        .expect("set through model");
    assert_eq!(
        email.errors().expect("errors"),
        vec!["email is required".to_string()]
    );

    let quiet = FormController::new(FormOptions {
        validate_on_value_update: false,
        ..FormOptions::default()
    });
    let name = quiet
        .register_with(
            "name",
            FieldOptions::default()
                .rule(required())
                .validate_on_value_update(true),
        )
        .expect("register name");
    quiet
        .field_model("name")
        .expect("field model")
        .set(json!(""))
        .expect("set through model");
    assert!(name.errors().expect("errors").is_empty());
    assert!(!name.meta().expect("meta").validated);
}

#[test]
fn display_error_waits_for_touch_or_submit() {
    let form = FormController::with_schema(
        Schema::rules([("email", required()), ("password", required())]),
        FormOptions::default(),
    );
    let email = form.register("email", None).expect("register email");
    form.register("password", None).expect("register password");

    assert!(!block_on(email.validate().expect("run")).expect("run").valid);
    assert_eq!(form.display_error("email").expect("display"), None);
    email.set_touched(true).expect("touch");
    assert_eq!(
        form.display_error("email").expect("display"),
        Some("email is required".to_string())
    );

    assert_eq!(form.display_error("password").expect("display"), None);
    block_on(form.handle_submit(|_values| ready(Ok(())))).expect("submit");
    assert_eq!(
        form.display_error("password").expect("display"),
        Some("password is required".to_string())
    );
    assert_eq!(form.display_error("missing").expect("display"), None);
}

#[test]
fn manual_errors_feed_the_aggregate() {
    let form = FormController::default();
    form.register("email", Some(json!("ada@calm.dev")))
        .expect("register email");
    form.register("name", Some(json!("Ada"))).expect("register name");

    form.set_errors([("email", vec!["Email is taken".to_string()])])
        .expect("set errors");
    assert!(!form.meta().expect("meta").valid);
    assert_eq!(
        form.errors().expect("errors"),
        BTreeMap::from([(path("email"), vec!["Email is taken".to_string()])])
    );

    form.set_field_error("email", Vec::new()).expect("clear error");
    assert!(form.meta().expect("meta").valid);
}

#[test]
fn reset_form_restores_values_and_submit_state() {
    let form = FormController::with_schema(
        Schema::rules([("name", required())]),
        FormOptions::default(),
    );
    let name = form.register("name", Some(json!(""))).expect("register name");
    block_on(form.handle_submit(|_values| ready(Ok(())))).expect("submit");
    assert_eq!(form.meta().expect("meta").submit_count, 1);

    form.reset_form(Some(json!({ "name": "Ada" })))
        .expect("reset form");
    let meta = form.meta().expect("meta");
    assert_eq!(meta.submit_count, 0);
    assert_eq!(meta.submit_state, SubmitState::Idle);
    assert!(meta.valid);
    assert_eq!(meta.initial_values, json!({ "name": "Ada" }));
    assert_eq!(name.value().expect("value"), json!("Ada"));
    assert!(name.errors().expect("errors").is_empty());
}

#[traced_test]
#[test]
fn unsupported_verdicts_are_reported_once_per_schema() {
    let form = FormController::default();
    let code = form
        .register_with(
            "code",
            FieldOptions::default()
                .initial_value(json!(""))
                .rule(FieldRule::new(|value: &Value, _: &RuleContext| {
                    if value == "" {
                        json!("Code is required")
                    } else {
                        json!(42)
                    }
                })),
        )
        .expect("register code");

    block_on(code.validate().expect("run")).expect("run");
    assert_eq!(
        code.errors().expect("errors"),
        vec!["Code is required".to_string()]
    );

    code.set_value(json!("abc")).expect("set code");
    block_on(code.validate().expect("run")).expect("run");
    assert_eq!(
        code.errors().expect("errors"),
        vec!["Code is required".to_string()]
    );
    let meta = code.meta().expect("meta");
    assert!(!meta.pending);
    assert!(!meta.valid);

    logs_assert(|lines: &[&str]| {
        match lines
            .iter()
            .filter(|line| line.contains("validator misconfigured"))
            .count()
        {
            1 => Ok(()),
            count => Err(format!("expected one report, saw {count}")),
        }
    });

    form.set_validation_schema(Schema::None).expect("replace schema");
    logs_assert(|lines: &[&str]| {
        match lines
            .iter()
            .filter(|line| line.contains("validator misconfigured"))
            .count()
        {
            2 => Ok(()),
            count => Err(format!("expected a second report, saw {count}")),
        }
    });
}

#[traced_test]
#[test]
fn validator_failures_become_the_failure_message() {
    let form = FormController::new(FormOptions {
        failure_message: "Could not validate".to_string(),
        ..FormOptions::default()
    });
    let panicking = form
        .register_with(
            "sync",
            FieldOptions::default().rule(FieldRule::new(
                |_: &Value, _: &RuleContext| -> bool { panic!("sync boom") },
            )),
        )
        .expect("register sync");
    let erroring = form
        .register_with(
            "remote",
            FieldOptions::default().rule(FieldRule::new(|_: &Value, _: &RuleContext| {
                RuleOutput::try_deferred(async { Err::<bool, _>("backend unavailable") })
            })),
        )
        .expect("register remote");

    let validation = block_on(form.validate()).expect("validate");
    assert!(!validation.valid);
    for field in [&panicking, &erroring] {
        assert_eq!(
            field.errors().expect("errors"),
            vec!["Could not validate".to_string()]
        );
        assert!(!field.meta().expect("meta").pending);
    }
    assert!(logs_contain("validator failed"));
    assert!(logs_contain("backend unavailable"));
    assert!(logs_contain("sync boom"));
}

#[traced_test]
#[test]
fn invalid_schema_keys_are_reported_and_skipped() {
    let form = FormController::with_schema(
        Schema::rules([("a..b", required()), ("name", required())]),
        FormOptions::default(),
    );
    let name = form.register("name", None).expect("register name");
    assert!(!block_on(name.validate().expect("run")).expect("run").valid);
    assert!(logs_contain("validation schema misconfigured"));
}

#[test]
fn labels_feed_default_messages() {
    let form = FormController::default();
    let field = form
        .register_with(
            "accept",
            FieldOptions::default()
                .label("Terms")
                .rule(FieldRule::new(|value: &Value, _: &RuleContext| {
                    value.as_bool().unwrap_or(false)
                })),
        )
        .expect("register accept");
    assert_eq!(field.label(), Some("Terms"));
    block_on(field.validate().expect("run")).expect("run");
    assert_eq!(
        field.error_message().expect("error message"),
        Some("Terms is not valid.".to_string())
    );
}
