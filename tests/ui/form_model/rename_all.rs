use calmform::form::FormModel;

#[derive(serde::Serialize, calmform::form::FormModel)]
#[serde(rename_all = "camelCase")]
struct ShippingForm {
    first_name: String,
    #[serde(rename = "zip")]
    postal_code: String,
    street_line_two: String,
}

#[derive(serde::Serialize, calmform::form::FormModel)]
#[serde(rename_all(serialize = "SCREAMING-KEBAB-CASE", deserialize = "snake_case"))]
struct BillingForm {
    card_holder: String,
}

fn main() {
    let fields = ShippingForm::fields();
    assert_eq!(fields.first_name().as_str(), "firstName");
    assert_eq!(fields.postal_code().as_str(), "zip");
    assert_eq!(
        ShippingForm::field_paths(),
        &["firstName", "zip", "streetLineTwo"]
    );
    assert_eq!(BillingForm::field_paths(), &["CARD-HOLDER"]);
    assert_eq!(BillingForm::fields().card_holder().as_str(), "CARD-HOLDER");
}
