//! Box Office: ticket reservations and the booking saga.
//!
//! A buyer reserves tickets through [`ReservationService::create_booking`].
//! The claimed units, the pending booking and a `booking.created` event
//! commit in one transaction. Payment and account services answer with
//! events of their own, and the sagas move the booking along its
//! transition table:
//!
//! ```text
//!             payment.completed / admin
//!   Pending ────────────────────────────▶ Confirmed ──admin──▶ Refunded
//!      │                                      │
//!      │ payment.failed / cancel              │ admin
//!      ▼                                      ▼
//!   Cancelled ◀───────────────────────────────┘
//! ```
//!
//! Every state change stages its events in the outbox inside the same
//! transaction; the relay publishes them after commit. Every consumer
//! records the dedupe key of each event it handles, so redelivery is
//! harmless.
//!
//! # Modules
//!
//! - [`store`]: inventory claims, bookings, outbox and ledger behind one
//!   unit of work (Postgres and in-memory)
//! - [`aggregates`]: the booking reducer
//! - [`service`]: synchronous entry points
//! - [`sagas`]: payment, account and notification consumers
//! - [`runtime`]: process wiring and graceful shutdown

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregates;
pub mod config;
pub mod error;
pub mod events;
pub mod publisher;
pub mod runtime;
pub mod sagas;
pub mod service;
pub mod store;
pub mod transition;
pub mod types;

pub use aggregates::booking::{Booking, BookingAction, BookingReducer, Outcome, Requester};
pub use config::Config;
pub use error::ReservationError;
pub use events::{EventPayload, PaymentDetails};
pub use service::ReservationService;
pub use store::{BookingView, InMemoryTicketStore, PgTicketStore, StoreError, TicketStore, UnitOfWork};
pub use types::*;
