//! Order placement input and its field-level validation.
//!
//! Inputs are deliberately loose (everything optional, signed quantities) so a
//! bad request produces a full list of messages instead of a single decode error.

use dabba_core::{in_amount_range, within_minor_unit};
use dabba_shared::Masked;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::error::OrderError;
use crate::models::{CustomerSnapshot, GeoPoint, LineItem, Payment, PaymentMethod, PaymentStatus};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CustomerInput {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub instructions: Option<String>,
    pub location: Option<GeoPoint>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LineItemInput {
    #[serde(alias = "productId")]
    pub product_id: Option<String>,
    pub name: Option<String>,
    #[serde(alias = "unitPrice", alias = "price")]
    pub unit_price: Option<Decimal>,
    pub quantity: Option<i64>,
    pub image: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PaymentInput {
    pub method: Option<String>,
    pub subtotal: Option<Decimal>,
    pub tax: Option<Decimal>,
    #[serde(alias = "deliveryFee")]
    pub delivery_fee: Option<Decimal>,
    pub total: Option<Decimal>,
}

/// Body of a create-order request: the cart plus delivery contact and payment breakdown.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewOrder {
    pub customer: Option<CustomerInput>,
    #[serde(default)]
    pub items: Vec<LineItemInput>,
    pub payment: Option<PaymentInput>,
}

pub(crate) struct ValidOrder {
    pub customer: CustomerSnapshot,
    pub items: Vec<LineItem>,
    pub payment: Payment,
}

fn required(value: &Option<String>, field: &str, errors: &mut Vec<String>) -> String {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => {
            errors.push(format!("{}: is required", field));
            String::new()
        }
    }
}

fn amount(value: Option<Decimal>, field: &str, default: Option<Decimal>, errors: &mut Vec<String>) -> Decimal {
    match value.or(default) {
        Some(v) if v.is_sign_negative() && !v.is_zero() => {
            errors.push(format!("{}: must not be negative", field));
            Decimal::ZERO
        }
        Some(v) if !in_amount_range(v) => {
            errors.push(format!("{}: amount out of range", field));
            Decimal::ZERO
        }
        Some(v) => v,
        None => {
            errors.push(format!("{}: is required", field));
            Decimal::ZERO
        }
    }
}

impl NewOrder {
    /// Checks every field and either returns the validated parts or all messages at once.
    pub(crate) fn validate(self) -> Result<ValidOrder, OrderError> {
        let mut errors = Vec::new();

        let customer_input = self.customer.unwrap_or_else(|| {
            errors.push("customer: is required".to_string());
            CustomerInput::default()
        });
        let customer = CustomerSnapshot {
            name: required(&customer_input.name, "customer.name", &mut errors),
            phone: Masked(required(&customer_input.phone, "customer.phone", &mut errors)),
            address: required(&customer_input.address, "customer.address", &mut errors),
            instructions: customer_input
                .instructions
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            location: customer_input.location,
        };
        if let Some(GeoPoint { lat, lng }) = customer.location {
            if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
                errors.push("customer.location: coordinates out of range".to_string());
            }
        }

        if self.items.is_empty() {
            errors.push("items: at least one item is required".to_string());
        }
        let mut items = Vec::with_capacity(self.items.len());
        for (i, item) in self.items.into_iter().enumerate() {
            let product_id = required(&item.product_id, &format!("items[{}].product_id", i), &mut errors);
            let name = required(&item.name, &format!("items[{}].name", i), &mut errors);
            let unit_price = amount(item.unit_price, &format!("items[{}].unit_price", i), None, &mut errors);
            let quantity = match item.quantity {
                Some(q) if q >= 1 && q <= u32::MAX as i64 => q as u32,
                Some(_) => {
                    errors.push(format!("items[{}].quantity: must be a positive integer", i));
                    0
                }
                None => {
                    errors.push(format!("items[{}].quantity: is required", i));
                    0
                }
            };
            items.push(LineItem { product_id, name, unit_price, quantity, image: item.image });
        }

        let payment_input = self.payment.unwrap_or_else(|| {
            errors.push("payment: is required".to_string());
            PaymentInput::default()
        });
        let method = match payment_input.method.as_deref().map(str::trim) {
            Some(m) if !m.is_empty() => match m.parse::<PaymentMethod>() {
                Ok(method) => Some(method),
                Err(_) => {
                    errors.push(format!(
                        "payment.method: must be one of cash_on_delivery, online, gateway (got '{}')",
                        m
                    ));
                    None
                }
            },
            _ => {
                errors.push("payment.method: is required".to_string());
                None
            }
        };
        let subtotal = amount(payment_input.subtotal, "payment.subtotal", None, &mut errors);
        let tax = amount(payment_input.tax, "payment.tax", Some(Decimal::ZERO), &mut errors);
        let delivery_fee = amount(payment_input.delivery_fee, "payment.delivery_fee", Some(Decimal::ZERO), &mut errors);
        let total = amount(payment_input.total, "payment.total", None, &mut errors);

        match subtotal.checked_add(tax).and_then(|sum| sum.checked_add(delivery_fee)) {
            Some(expected) => {
                if payment_input.total.is_some() && !within_minor_unit(total, expected) {
                    errors.push(format!(
                        "payment.total: {} does not equal subtotal + tax + delivery_fee ({})",
                        total, expected
                    ));
                }
            }
            None => errors.push("payment.total: amount out of range".to_string()),
        }

        match method {
            Some(method) if errors.is_empty() => Ok(ValidOrder {
                customer,
                items,
                payment: Payment {
                    method,
                    subtotal,
                    tax,
                    delivery_fee,
                    total,
                    payment_status: PaymentStatus::Pending,
                    gateway_order_ref: None,
                    gateway_payment_ref: None,
                    paid_at: None,
                    refund_ref: None,
                    refunded_amount: None,
                },
            }),
            _ => Err(OrderError::Validation(errors)),
        }
    }
}
