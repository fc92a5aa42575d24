//! Mock checkout: a fixed cart and a payment form that never charges anything

use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Amount in cents
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Money(pub u64);

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}.{:02}", self.0 / 100, self.0 % 100)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LineItem {
    pub name: String,
    pub tier: String,
    pub price: Money,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Discount {
    pub code: String,
    pub amount: Money,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub items: Vec<LineItem>,
    pub discount: Option<Discount>,
    pub shipping: Money,
    /// Tax rate in basis points, applied after the discount
    pub tax_rate_bps: u64,
}

impl Order {
    /// The single-plan cart shown on the demo checkout page
    pub fn demo() -> Self {
        Self {
            items: vec![LineItem {
                name: "Hyper AI Plan".to_string(),
                tier: "Annual subscription".to_string(),
                price: Money(9_900),
            }],
            discount: Some(Discount {
                code: "SAAS2023".to_string(),
                amount: Money(1_000),
            }),
            shipping: Money(0),
            tax_rate_bps: 1_000,
        }
    }

    pub fn subtotal(&self) -> Money {
        Money(self.items.iter().map(|item| item.price.0).sum())
    }

    fn discounted(&self) -> u64 {
        let discount = self.discount.as_ref().map_or(0, |d| d.amount.0);
        self.subtotal().0.saturating_sub(discount)
    }

    pub fn taxes(&self) -> Money {
        // Round half up to the cent
        Money((self.discounted() * self.tax_rate_bps + 5_000) / 10_000)
    }

    pub fn total(&self) -> Money {
        Money(self.discounted() + self.taxes().0 + self.shipping.0)
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for item in &self.items {
            writeln!(f, "{} ({}) {}", item.name, item.tier, item.price)?;
        }
        writeln!(f, "Subtotal: {}", self.subtotal())?;
        if let Some(discount) = &self.discount {
            writeln!(f, "Discount [{}]: -{}", discount.code, discount.amount)?;
        }
        writeln!(f, "Taxes: {}", self.taxes())?;
        writeln!(f, "Shipping: {}", self.shipping)?;
        write!(f, "Total: {}", self.total())
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum PaymentError {
    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("Invalid {0}")]
    InvalidField(&'static str),
}

#[derive(Debug, Clone, Default)]
pub struct PaymentForm {
    pub email: String,
    pub name_on_card: String,
    pub card_number: String,
    /// `MM/YY`
    pub expiration: String,
    pub cvc: String,
    pub address: String,
    pub city: String,
    pub region: String,
    pub postal_code: String,
}

impl PaymentForm {
    /// Shape checks only; nothing is sent anywhere
    pub fn validate(&self) -> Result<(), PaymentError> {
        let required = [
            ("Email address", &self.email),
            ("Name on card", &self.name_on_card),
            ("Card number", &self.card_number),
            ("Expiration date", &self.expiration),
            ("CVC", &self.cvc),
            ("Address", &self.address),
            ("City", &self.city),
            ("State / Province", &self.region),
            ("Postal code", &self.postal_code),
        ];
        if let Some((field, _)) = required.iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(PaymentError::MissingField(*field));
        }

        if !self.email.contains('@') {
            return Err(PaymentError::InvalidField("email address"));
        }

        let digits: String = self
            .card_number
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-')
            .collect();
        if !(12..=19).contains(&digits.len()) || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(PaymentError::InvalidField("card number"));
        }

        let expiration_ok = self
            .expiration
            .split_once('/')
            .and_then(|(mm, yy)| {
                let month: u8 = mm.trim().parse().ok()?;
                (yy.trim().len() == 2 && yy.trim().parse::<u8>().is_ok()).then_some(month)
            })
            .map_or(false, |month| (1..=12).contains(&month));
        if !expiration_ok {
            return Err(PaymentError::InvalidField("expiration date"));
        }

        let cvc = self.cvc.trim();
        if !(3..=4).contains(&cvc.len()) || !cvc.chars().all(|c| c.is_ascii_digit()) {
            return Err(PaymentError::InvalidField("CVC"));
        }

        Ok(())
    }

    /// Pretend to process a payment: validate, wait `delay`, report success
    pub async fn submit(&self, order: &Order, delay: Duration) -> Result<Money, PaymentError> {
        self.validate()?;
        tokio::time::sleep(delay).await;
        info!(total = %order.total(), "Payment verified");
        Ok(order.total())
    }
}
