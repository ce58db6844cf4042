pub mod money;
pub mod payment;
pub mod signature;

pub use money::{in_amount_range, to_minor_units, within_minor_unit, MAX_AMOUNT};
pub use payment::{
    CreateGatewayOrder, GatewayError, GatewayOrder, GatewayRefund, MockFailure, MockPaymentGateway,
    PaymentGateway,
};
