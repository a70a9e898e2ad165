//! Role and session-id resolution from the entry URL.
//!
//! The URL convention is `<origin><path>#<driverEndpointId>`: a non-empty
//! fragment makes this client a customer watching that driver, no fragment
//! makes it a driver. Resolution happens once, before the session starts,
//! and the result is handed to the session by value.

use rand::Rng;

use crate::transport::EndpointId;

/// Which side of the tracker this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Driver,
    Customer,
}

/// Result of resolving the entry URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// Broadcast our own location; the endpoint id is assigned on open.
    Driver,
    /// Watch the driver whose endpoint id was in the fragment.
    Customer { target: EndpointId },
}

impl Identity {
    /// Resolve from the full entry URL (or just its `#fragment`).
    pub fn resolve(entry_url: &str) -> Self {
        match entry_url.split_once('#') {
            Some((_, fragment)) if !fragment.is_empty() => Self::Customer {
                target: EndpointId::from(fragment),
            },
            _ => Self::Driver,
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Self::Driver => Role::Driver,
            Self::Customer { .. } => Role::Customer,
        }
    }

    /// The driver to connect to, for a customer.
    pub fn target(&self) -> Option<&EndpointId> {
        match self {
            Self::Driver => None,
            Self::Customer { target } => Some(target),
        }
    }
}

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Candidate driver id: `prefix` followed by `suffix_len` lowercase
/// base-36 characters, e.g. `wagashi-ab12cd`.
pub fn generate_driver_id<R: Rng + ?Sized>(rng: &mut R, prefix: &str, suffix_len: usize) -> EndpointId {
    let mut id = String::with_capacity(prefix.len() + suffix_len);
    id.push_str(prefix);
    for _ in 0..suffix_len {
        let idx = rng.gen_range(0..ID_ALPHABET.len());
        id.push(ID_ALPHABET[idx] as char);
    }
    EndpointId::from(id)
}

/// Link a customer opens to watch `delivery_id`.
///
/// Any fragment already present on `base` is replaced.
pub fn share_link(base: &str, delivery_id: &EndpointId) -> String {
    let base = base.split_once('#').map_or(base, |(head, _)| head);
    format!("{base}#{delivery_id}")
}
