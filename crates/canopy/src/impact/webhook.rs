//! Shopify webhook topics and HMAC verification.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use super::domain::{lenient_identifier, OrderEvent};

type HmacSha256 = Hmac<Sha256>;

pub const HMAC_HEADER: &str = "x-shopify-hmac-sha256";
pub const TOPIC_HEADER: &str = "x-shopify-topic";
pub const SHOP_DOMAIN_HEADER: &str = "x-shopify-shop-domain";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookTopic {
    OrdersPaid,
    OrdersCreate,
    AppUninstalled,
    ShopRedact,
    CustomersDataRequest,
    CustomersRedact,
    Other(String),
}

impl WebhookTopic {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "orders/paid" => Self::OrdersPaid,
            "orders/create" => Self::OrdersCreate,
            "app/uninstalled" => Self::AppUninstalled,
            "shop/redact" => Self::ShopRedact,
            "customers/data_request" => Self::CustomersDataRequest,
            "customers/redact" => Self::CustomersRedact,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn order_event(&self) -> Option<OrderEvent> {
        match self {
            Self::OrdersPaid => Some(OrderEvent::Paid),
            Self::OrdersCreate => Some(OrderEvent::Created),
            _ => None,
        }
    }
}

/// Checks `X-Shopify-Hmac-Sha256` against the app's API secret.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: Option<String>,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("configured", &self.secret.is_some())
            .finish()
    }
}

impl WebhookVerifier {
    pub fn new(secret: Option<String>) -> Self {
        Self { secret }
    }

    fn mac(&self) -> Option<HmacSha256> {
        let secret = self.secret.as_deref()?;
        HmacSha256::new_from_slice(secret.as_bytes()).ok()
    }

    /// Base64 signature for `body`; `None` without a configured secret.
    pub fn sign(&self, body: &[u8]) -> Option<String> {
        let mut mac = self.mac()?;
        mac.update(body);
        Some(STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// Constant-time comparison; an unconfigured secret rejects everything.
    pub fn verify(&self, body: &[u8], signature: Option<&str>) -> bool {
        let (Some(mut mac), Some(signature)) = (self.mac(), signature) else {
            return false;
        };
        let Ok(expected) = STANDARD.decode(signature.trim()) else {
            return false;
        };
        mac.update(body);
        mac.verify_slice(&expected).is_ok()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedactCustomer {
    #[serde(deserialize_with = "lenient_identifier")]
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Body of `customers/redact` and `customers/data_request`.
#[derive(Debug, Clone, Deserialize)]
pub struct CustomerPrivacyPayload {
    pub customer: RedactCustomer,
}
