//! Core domain models and strongly-typed identifiers.
//!
//! Defines the callback ledger record and its status state machine, the
//! dispatch event handed to the producer, the merchant-facing webhook payload,
//! and pagination primitives for ledger reads.

use std::{fmt, str::FromStr};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    std::result::Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self> {
                Uuid::parse_str(s.trim()).map(Self).map_err(|e| {
                    CoreError::InvalidInput(format!(
                        "{} is not a valid {}: {e}",
                        s,
                        stringify!($name)
                    ))
                })
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
                let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
                Ok(Self(uuid))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

uuid_id!(
    /// Primary key of a callback ledger row.
    CallbackLogId
);

uuid_id!(
    /// Originating payment transaction. One ledger lineage per transaction.
    TransactionId
);

uuid_id!(
    /// Merchant that owns the callback endpoint. Used as the partition key.
    MerchantId
);

uuid_id!(
    /// User who initiated the transaction.
    UserId
);

/// Delivery status of a callback ledger row.
///
/// ```text
/// Pending -> Initiated -> Success
///                     \-> Failed -> Initiated -> ... -> Expired
/// ```
///
/// `Success` and `Expired` are terminal. The integer codes are persisted and
/// must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum CallbackStatus {
    /// Row created, no attempt made yet.
    Pending = 0,
    /// An outbound attempt is in flight.
    Initiated = 1,
    /// Merchant acknowledged with a 2xx response.
    Success = 2,
    /// Last attempt failed; a retry is scheduled.
    Failed = 3,
    /// Retry budget exhausted.
    Expired = 4,
}

impl CallbackStatus {
    /// All statuses in code order.
    pub const ALL: [Self; 5] =
        [Self::Pending, Self::Initiated, Self::Success, Self::Failed, Self::Expired];

    /// Persisted integer code.
    pub const fn code(self) -> i16 {
        self as i16
    }

    /// Whether no further transition is permitted.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Expired)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// The `Expired` edge is additionally guarded by the retry budget in
    /// [`CallbackLog::record_failure`].
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Initiated)
                | (Self::Initiated, Self::Success | Self::Failed | Self::Expired)
                | (Self::Failed, Self::Initiated | Self::Expired)
        )
    }
}

impl TryFrom<i16> for CallbackStatus {
    type Error = CoreError;

    fn try_from(code: i16) -> Result<Self> {
        match code {
            0 => Ok(Self::Pending),
            1 => Ok(Self::Initiated),
            2 => Ok(Self::Success),
            3 => Ok(Self::Failed),
            4 => Ok(Self::Expired),
            _ => Err(CoreError::InvalidStatus { code }),
        }
    }
}

impl fmt::Display for CallbackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Initiated => write!(f, "initiated"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

/// Payment status vocabulary recognised on dispatch events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    /// Awaiting processor confirmation.
    Pending,
    /// Submitted to the processor.
    Initiated,
    /// Settled successfully.
    Success,
    /// Rejected by the processor.
    Failed,
    /// Payment window elapsed.
    Expired,
    /// Cancelled by the payer or merchant.
    Canceled,
    /// Funds returned to the payer.
    Refunded,
    /// Status manually overridden by an operator.
    Overridden,
}

impl FromStr for TransactionStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "INITIATED" => Ok(Self::Initiated),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            "EXPIRED" => Ok(Self::Expired),
            "CANCELED" | "CANCELLED" => Ok(Self::Canceled),
            "REFUNDED" => Ok(Self::Refunded),
            "OVERRIDDEN" => Ok(Self::Overridden),
            _ => Err(CoreError::InvalidInput(format!("unrecognized transaction status: {s}"))),
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Initiated => "INITIATED",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Expired => "EXPIRED",
            Self::Canceled => "CANCELED",
            Self::Refunded => "REFUNDED",
            Self::Overridden => "OVERRIDDEN",
        };
        f.write_str(s)
    }
}

/// Durable record of one webhook delivery lineage.
///
/// Mutated only by the delivery use case and never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackLog {
    /// Primary key.
    pub id: CallbackLogId,
    /// User who initiated the transaction.
    pub user_id: UserId,
    /// Originating transaction.
    pub txn_id: TransactionId,
    /// Merchant receiving the callback.
    pub merchant_id: MerchantId,
    /// Merchant endpoint the request body is posted to.
    pub callback_url: String,
    /// Current delivery status.
    pub status: CallbackStatus,
    /// Outbound payload sent to the merchant.
    pub request_body: String,
    /// Body of the last response received, if any.
    pub response_body: Option<String>,
    /// Failed attempts so far.
    pub retry_count: i32,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// When the row last changed.
    pub updated_at: DateTime<Utc>,
}

impl CallbackLog {
    /// Creates a `Pending` ledger row with no attempts.
    pub fn new(
        user_id: UserId,
        txn_id: TransactionId,
        merchant_id: MerchantId,
        callback_url: impl Into<String>,
        request_body: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: CallbackLogId::new(),
            user_id,
            txn_id,
            merchant_id,
            callback_url: callback_url.into(),
            status: CallbackStatus::Pending,
            request_body: request_body.into(),
            response_body: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the row has reached `Success` or `Expired`.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Moves the row to `next`, stamping `updated_at`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` if the state machine forbids the
    /// edge.
    pub fn transition_to(&mut self, next: CallbackStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition { from: self.status, to: next });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Records a 2xx response on the in-flight attempt.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` unless the row is `Initiated`.
    pub fn record_success(&mut self, response_body: String, now: DateTime<Utc>) -> Result<()> {
        self.transition_to(CallbackStatus::Success, now)?;
        self.response_body = Some(response_body);
        Ok(())
    }

    /// Records a failed attempt and returns the resulting status.
    ///
    /// `max_retries` counts retries after the first attempt. While
    /// `retry_count < max_retries` the count is incremented and the row
    /// becomes `Failed`; otherwise the budget is spent and the row becomes
    /// `Expired` with `retry_count == max_retries`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` unless the row is `Initiated`.
    pub fn record_failure(
        &mut self,
        response_body: Option<String>,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<CallbackStatus> {
        if self.status != CallbackStatus::Initiated {
            return Err(CoreError::InvalidTransition {
                from: self.status,
                to: CallbackStatus::Failed,
            });
        }

        let max = i32::try_from(max_retries).unwrap_or(i32::MAX);
        let (next, next_count) = if self.retry_count < max {
            (CallbackStatus::Failed, self.retry_count + 1)
        } else {
            (CallbackStatus::Expired, self.retry_count)
        };

        self.transition_to(next, now)?;
        self.retry_count = next_count;
        if response_body.is_some() {
            self.response_body = response_body;
        }
        Ok(next)
    }
}

/// Ephemeral event handed to the grouped producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchEvent {
    /// Queue and broker partition key, normally the merchant id.
    pub partition_key: String,
    /// Opaque payload bytes.
    pub payload: Bytes,
    /// When the event was produced.
    pub produced_at: DateTime<Utc>,
}

impl DispatchEvent {
    /// Creates a dispatch event stamped with `produced_at`.
    pub fn new(
        partition_key: impl Into<String>,
        payload: impl Into<Bytes>,
        produced_at: DateTime<Utc>,
    ) -> Self {
        Self { partition_key: partition_key.into(), payload: payload.into(), produced_at }
    }
}

/// JSON body of a payment-status webhook.
///
/// This is both the decoded value of a `webhook_dispatch` record and the body
/// posted to the merchant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    /// Event type, e.g. `payment.status_changed`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Originating transaction id.
    pub transaction_id: String,
    /// Payment status, validated against [`TransactionStatus`].
    pub status: String,
    /// Human readable status message.
    #[serde(default)]
    pub message: String,
    /// Processor-side transaction reference.
    #[serde(default)]
    pub provider_tx_id: Option<String>,
    /// Processor-specific details.
    #[serde(default)]
    pub provider_data: Option<serde_json::Value>,
    /// When the status change happened.
    pub timestamp: DateTime<Utc>,
    /// Merchant endpoint to notify.
    pub callback_url: String,
    /// Merchant id.
    pub merchant_id: String,
    /// User id.
    pub user_id: String,
    /// Whether the payment came through hosted checkout.
    #[serde(default)]
    pub is_hosted_checkout: bool,
}

/// Dispatch payload that passed boundary validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedDispatch {
    /// Parsed transaction id.
    pub txn_id: TransactionId,
    /// Parsed merchant id.
    pub merchant_id: MerchantId,
    /// Parsed user id.
    pub user_id: UserId,
    /// Trimmed merchant endpoint.
    pub callback_url: String,
}

impl WebhookPayload {
    /// Validates the status vocabulary, identifiers and callback URL.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` describing the first rejected field.
    pub fn validate(&self) -> Result<ValidatedDispatch> {
        self.status.parse::<TransactionStatus>()?;
        let txn_id = self.transaction_id.parse::<TransactionId>()?;
        let merchant_id = self.merchant_id.parse::<MerchantId>()?;
        let user_id = self.user_id.parse::<UserId>()?;

        let callback_url = self.callback_url.trim();
        if callback_url.is_empty() {
            return Err(CoreError::InvalidInput("callbackUrl must not be empty".to_string()));
        }
        if !(callback_url.starts_with("http://") || callback_url.starts_with("https://")) {
            return Err(CoreError::InvalidInput(format!(
                "callbackUrl must be an http(s) URL: {callback_url}"
            )));
        }

        Ok(ValidatedDispatch {
            txn_id,
            merchant_id,
            user_id,
            callback_url: callback_url.to_string(),
        })
    }
}

/// Default page size for ledger listings.
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Largest page size a caller may request.
pub const MAX_PAGE_SIZE: u32 = 100;

/// One-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Page number, starting at 1.
    pub page: u32,
    /// Items per page.
    pub page_size: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { page: 1, page_size: DEFAULT_PAGE_SIZE }
    }
}

impl Pagination {
    /// Creates a validated page request.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` for page 0, page size 0, or a page
    /// size above [`MAX_PAGE_SIZE`].
    pub fn new(page: u32, page_size: u32) -> Result<Self> {
        if page == 0 {
            return Err(CoreError::InvalidInput("page starts at 1".to_string()));
        }
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(CoreError::InvalidInput(format!(
                "page_size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        Ok(Self { page, page_size })
    }

    /// Rows to skip.
    pub fn offset(&self) -> i64 {
        i64::from(self.page.saturating_sub(1)) * i64::from(self.page_size)
    }

    /// Rows to return.
    pub fn limit(&self) -> i64 {
        i64::from(self.page_size)
    }
}

/// One page of results plus the total row count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Items on this page.
    pub items: Vec<T>,
    /// Total rows matching the query.
    pub total: u64,
    /// Page number.
    pub page: u32,
    /// Requested page size.
    pub page_size: u32,
}

impl<T> Page<T> {
    /// Number of pages needed for `total` rows.
    pub fn total_pages(&self) -> u64 {
        if self.page_size == 0 {
            return 0;
        }
        self.total.div_ceil(u64::from(self.page_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> WebhookPayload {
        WebhookPayload {
            event_type: "payment.status_changed".to_string(),
            transaction_id: Uuid::new_v4().to_string(),
            status: "SUCCESS".to_string(),
            message: "paid".to_string(),
            provider_tx_id: Some("MP123".to_string()),
            provider_data: None,
            timestamp: Utc::now(),
            callback_url: "https://merchant.example.com/hook".to_string(),
            merchant_id: Uuid::new_v4().to_string(),
            user_id: Uuid::new_v4().to_string(),
            is_hosted_checkout: false,
        }
    }

    fn initiated_log() -> CallbackLog {
        let mut log = CallbackLog::new(
            UserId::new(),
            TransactionId::new(),
            MerchantId::new(),
            "https://merchant.example.com/hook",
            "{}",
            Utc::now(),
        );
        log.transition_to(CallbackStatus::Initiated, Utc::now()).unwrap();
        log
    }

    #[test]
    fn status_codes_round_trip_and_reject_out_of_range() {
        for status in CallbackStatus::ALL {
            assert_eq!(CallbackStatus::try_from(status.code()).unwrap(), status);
        }
        assert!(matches!(
            CallbackStatus::try_from(5),
            Err(CoreError::InvalidStatus { code: 5 })
        ));
        assert!(matches!(
            CallbackStatus::try_from(-1),
            Err(CoreError::InvalidStatus { code: -1 })
        ));
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for from in [CallbackStatus::Success, CallbackStatus::Expired] {
            for to in CallbackStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
    }

    #[test]
    fn pending_cannot_skip_initiated() {
        let mut log = initiated_log();
        log.status = CallbackStatus::Pending;

        let err = log.transition_to(CallbackStatus::Success, Utc::now()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
        assert_eq!(log.status, CallbackStatus::Pending);
    }

    #[test]
    fn failure_increments_retry_count_until_expired() {
        let mut log = initiated_log();

        let status = log.record_failure(Some("boom".into()), 3, Utc::now()).unwrap();
        assert_eq!(status, CallbackStatus::Failed);
        assert_eq!(log.retry_count, 1);
        assert_eq!(log.response_body.as_deref(), Some("boom"));

        for expected_count in 2..=3 {
            log.transition_to(CallbackStatus::Initiated, Utc::now()).unwrap();
            assert_eq!(log.record_failure(None, 3, Utc::now()).unwrap(), CallbackStatus::Failed);
            assert_eq!(log.retry_count, expected_count);
        }

        // Fourth failure: the three retries are spent.
        log.transition_to(CallbackStatus::Initiated, Utc::now()).unwrap();
        assert_eq!(log.record_failure(None, 3, Utc::now()).unwrap(), CallbackStatus::Expired);
        assert_eq!(log.retry_count, 3);
        assert!(log.is_terminal());

        assert!(log.transition_to(CallbackStatus::Initiated, Utc::now()).is_err());
    }

    #[test]
    fn zero_retry_budget_expires_on_first_failure() {
        let mut log = initiated_log();
        assert_eq!(log.record_failure(None, 0, Utc::now()).unwrap(), CallbackStatus::Expired);
        assert_eq!(log.retry_count, 0);
    }

    #[test]
    fn failure_outside_initiated_rejected() {
        let mut log = initiated_log();
        log.record_success("ok".into(), Utc::now()).unwrap();

        assert!(log.record_failure(None, 3, Utc::now()).is_err());
        assert_eq!(log.status, CallbackStatus::Success);
        assert_eq!(log.retry_count, 0);
    }

    #[test]
    fn transaction_status_parsing_is_case_insensitive() {
        assert_eq!("success".parse::<TransactionStatus>().unwrap(), TransactionStatus::Success);
        assert_eq!(" Failed ".parse::<TransactionStatus>().unwrap(), TransactionStatus::Failed);
        assert_eq!("cancelled".parse::<TransactionStatus>().unwrap(), TransactionStatus::Canceled);
        assert!("bogus".parse::<TransactionStatus>().is_err());
    }

    #[test]
    fn payload_validation_rejects_bad_fields() {
        assert!(sample_payload().validate().is_ok());

        let mut bogus = sample_payload();
        bogus.status = "bogus".to_string();
        assert!(bogus.validate().is_err());

        let mut bad_id = sample_payload();
        bad_id.transaction_id = "not-a-uuid".to_string();
        assert!(bad_id.validate().is_err());

        let mut no_url = sample_payload();
        no_url.callback_url = "  ".to_string();
        assert!(no_url.validate().is_err());

        let mut ftp = sample_payload();
        ftp.callback_url = "ftp://merchant.example.com".to_string();
        assert!(ftp.validate().is_err());
    }

    #[test]
    fn validated_dispatch_carries_parsed_fields() {
        let mut payload = sample_payload();
        payload.callback_url = format!("  {}  ", payload.callback_url);

        let validated = payload.validate().unwrap();
        assert_eq!(validated.txn_id.to_string(), payload.transaction_id);
        assert_eq!(validated.merchant_id.to_string(), payload.merchant_id);
        assert_eq!(validated.callback_url, payload.callback_url.trim());
    }

    #[test]
    fn payload_uses_camel_case_wire_names() {
        let json = serde_json::to_value(sample_payload()).unwrap();
        for field in [
            "type",
            "transactionId",
            "status",
            "message",
            "providerTxId",
            "providerData",
            "timestamp",
            "callbackUrl",
            "merchantId",
            "userId",
            "isHostedCheckout",
        ] {
            assert!(json.get(field).is_some(), "missing field {field}");
        }
    }

    #[test]
    fn pagination_bounds() {
        assert!(Pagination::new(0, 10).is_err());
        assert!(Pagination::new(1, 0).is_err());
        assert!(Pagination::new(1, MAX_PAGE_SIZE + 1).is_err());

        let page = Pagination::new(3, 25).unwrap();
        assert_eq!(page.offset(), 50);
        assert_eq!(page.limit(), 25);
    }

    #[test]
    fn page_counts_partial_pages() {
        let page: Page<()> = Page { items: vec![], total: 41, page: 1, page_size: 20 };
        assert_eq!(page.total_pages(), 3);
    }
}
