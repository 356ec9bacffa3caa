//! Core domain models and ledger storage.
//!
//! Provides the callback ledger record and its status state machine, the
//! dispatch event and webhook payload types, the clock abstraction used for
//! all retry timing, and the ledger repositories. The dispatch crate and the
//! service binary build on these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    CallbackLog, CallbackLogId, CallbackStatus, DispatchEvent, MerchantId, Page, Pagination,
    TransactionId, TransactionStatus, UserId, ValidatedDispatch, WebhookPayload,
};
pub use storage::{CallbackLogRepository, InMemoryRepository};
pub use time::{Clock, RealClock, TestClock};
