use calmform::form::FormModel;

#[derive(serde::Serialize, calmform::form::FormModel)]
struct SignupForm {
    email: String,
    #[serde(rename = "displayName")]
    display_name: String,
    #[serde(skip)]
    #[allow(dead_code)]
    session: u64,
}

fn main() {
    let fields = SignupForm::fields();
    assert_eq!(fields.email().as_str(), "email");
    assert_eq!(fields.display_name().as_str(), "displayName");
    assert_eq!(SignupForm::field_paths(), &["email", "displayName"]);
}
