//! Venue integration: signing, wire types, and the HTTP transport.
//!
//! Everything outside this module talks to the venue only through the
//! [`VenueTransport`] trait — no module above this one constructs URLs,
//! signs a payload, or parses a raw HTTP response.

pub mod auth;
pub mod transport;
pub mod types;

pub use auth::Credentials;
pub use transport::{ClientConfig, HttpMethod, HttpVenueTransport, VenueTransport};
pub use types::{
    CreateOrderRequest, CreateRfqData, CreateRfqRequest, QueryOrderData, RfqLegRequest,
    TransportResponse, VenueOrderState, VenueQuote, VenueQuoteLeg,
};
