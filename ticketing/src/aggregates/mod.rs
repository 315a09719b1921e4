//! Aggregate reducers.

pub mod booking;

pub use booking::{Booking, BookingAction, BookingEffect, BookingEnvironment, BookingReducer, Outcome, Requester};
