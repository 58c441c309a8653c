#![allow(dead_code)] // Each integration test binary uses a slice of this.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use consistently::codec::{ErasableSchema, Message, TypedJsonCodec};
use consistently::store::memory::InMemoryEventStorage;
use consistently::stream::EventStream;
use consistently::EventStreamId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub street: Option<String>,
    pub city: Option<String>,
    pub postal_code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerRegistered {
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub address: Address,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerRenamed {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerConfirmed {}

/// The payload shape of the deprecated rename event, kept only so stored
/// history decodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerNameChanged {
    pub new_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CustomerEvent {
    Registered(CustomerRegistered),
    Renamed(CustomerRenamed),
    Confirmed(CustomerConfirmed),
}

impl Message for CustomerEvent {
    fn name(&self) -> &str {
        match self {
            CustomerEvent::Registered(_) => "CustomerRegistered",
            CustomerEvent::Renamed(_) => "CustomerRenamed",
            CustomerEvent::Confirmed(_) => "CustomerConfirmed",
        }
    }
}

pub fn customer_codec() -> TypedJsonCodec<CustomerEvent> {
    TypedJsonCodec::new()
        .with_type(
            "CustomerRegistered",
            ErasableSchema::new()
                .erasable("name")
                .erasable("email")
                .partial(
                    "address",
                    ErasableSchema::new().erasable("street").erasable("city"),
                ),
            CustomerEvent::Registered,
            |event| match event {
                CustomerEvent::Registered(payload) => Some(payload),
                _ => None,
            },
        )
        .with_type(
            "CustomerRenamed",
            ErasableSchema::new().erasable("name"),
            CustomerEvent::Renamed,
            |event| match event {
                CustomerEvent::Renamed(payload) => Some(payload),
                _ => None,
            },
        )
        .with_type(
            "CustomerConfirmed",
            ErasableSchema::new(),
            CustomerEvent::Confirmed,
            |event| match event {
                CustomerEvent::Confirmed(payload) => Some(payload),
                _ => None,
            },
        )
        .with_legacy_type(
            "CustomerNameChanged",
            "CustomerRenamed",
            |legacy: CustomerNameChanged| {
                CustomerEvent::Renamed(CustomerRenamed {
                    name: legacy.new_name,
                })
            },
        )
}

pub type CustomerStream = EventStream<InMemoryEventStorage, TypedJsonCodec<CustomerEvent>>;

pub fn customer_stream(id: EventStreamId, storage: &Arc<InMemoryEventStorage>) -> CustomerStream {
    EventStream::new(id, Arc::clone(storage), Arc::new(customer_codec()))
}

pub fn registered(id: &str, name: &str, email: &str, street: &str, postal_code: &str) -> CustomerEvent {
    CustomerEvent::Registered(CustomerRegistered {
        id: id.to_owned(),
        name: Some(name.to_owned()),
        email: Some(email.to_owned()),
        address: Address {
            street: Some(street.to_owned()),
            city: Some("XY".to_owned()),
            postal_code: postal_code.to_owned(),
        },
    })
}

pub fn renamed(name: &str) -> CustomerEvent {
    CustomerEvent::Renamed(CustomerRenamed {
        name: name.to_owned(),
    })
}

pub fn confirmed() -> CustomerEvent {
    CustomerEvent::Confirmed(CustomerConfirmed {})
}
